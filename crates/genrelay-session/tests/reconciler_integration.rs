#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use genrelay_core::{
    ArtifactRef, GenerationError, GenrelayError, Message, MessageIdentity, StoreId,
};
use genrelay_generation::{
    ArtifactGenerator, CoordinatorConfig, GenerationCoordinator, PromptDescriptor,
};
use genrelay_session::{
    AssociationOutcome, FileMessageStore, InMemoryMessageStore, MessageStore,
    PersistenceReconciler, ReconcilerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct EchoGenerator;

#[async_trait]
impl ArtifactGenerator for EchoGenerator {
    async fn generate(&self, descriptor: &PromptDescriptor) -> Result<ArtifactRef, GenerationError> {
        Ok(ArtifactRef::new(format!("mem://{}", descriptor.prompt)))
    }
}

async fn new_message(store: &dyn MessageStore) -> StoreId {
    store
        .create_message(&Message::assistant("drawing it now", Uuid::new_v4()))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Ordering between artifact readiness and promotion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_artifact_ready_before_promotion_yields_single_row() {
    let store = Arc::new(InMemoryMessageStore::new());
    let reconciler = Arc::new(PersistenceReconciler::new(
        store.clone(),
        &ReconcilerConfig::default(),
    ));
    let key = PromptDescriptor::new("cat").key();
    let identity = MessageIdentity::ephemeral();
    let token = identity.token().unwrap();

    let outcome = reconciler
        .on_artifact_ready(identity, &key, ArtifactRef::new("blob://cat"))
        .await
        .unwrap();
    assert_eq!(outcome, AssociationOutcome::Parked);

    // Promotion lands a little later, as the turn's store write completes.
    let id = new_message(store.as_ref()).await;
    let promoter = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reconciler.on_identity_promoted(token, id).await
        }
    });
    assert_eq!(promoter.await.unwrap().unwrap(), 1);

    let rows = store.find_associations(id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].store_id, id);
    assert_eq!(rows[0].prompt, "cat");
    assert_eq!(rows[0].artifact_ref.as_str(), "blob://cat");

    // A duplicate promotion signal does not write again.
    assert_eq!(reconciler.on_identity_promoted(token, id).await.unwrap(), 0);
    assert_eq!(store.find_associations(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_associations_write_one_row() {
    let store = Arc::new(InMemoryMessageStore::new());
    let reconciler = Arc::new(PersistenceReconciler::new(
        store.clone(),
        &ReconcilerConfig::default(),
    ));
    let id = new_message(store.as_ref()).await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .associate(id, "cat", ArtifactRef::new("blob://cat"))
                    .await
            })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == AssociationOutcome::Inserted {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(store.find_associations(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_distinct_prompts_all_persist_to_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path().to_path_buf()).await.unwrap());
    let reconciler = Arc::new(PersistenceReconciler::new(
        store.clone(),
        &ReconcilerConfig::default(),
    ));
    let id = new_message(store.as_ref()).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .associate(id, &format!("prompt {i}"), ArtifactRef::new(format!("blob://{i}")))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Reopen to read what actually reached disk.
    let reopened = FileMessageStore::new(dir.path().to_path_buf()).await.unwrap();
    let mut prompts: Vec<_> = reopened
        .find_associations(id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.prompt)
        .collect();
    prompts.sort();
    assert_eq!(prompts.len(), 8);
    assert_eq!(prompts[0], "prompt 0");

    let next = new_message(&reopened).await;
    assert!(next > id);
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unpromoted_artifact_times_out_and_can_be_reattached_from_cache() {
    let store = Arc::new(InMemoryMessageStore::new());
    let reconciler = PersistenceReconciler::new(
        store.clone(),
        &ReconcilerConfig {
            orphan_timeout_secs: 0,
            ..ReconcilerConfig::default()
        },
    );
    let coord = GenerationCoordinator::new(Arc::new(EchoGenerator), &CoordinatorConfig::default());
    let key = PromptDescriptor::new("cat").key();

    let artifact = coord.request(PromptDescriptor::new("cat")).await.unwrap();
    reconciler
        .on_artifact_ready(MessageIdentity::ephemeral(), &key, artifact)
        .await
        .unwrap();

    let orphans = reconciler.sweep_expired();
    assert_eq!(orphans.len(), 1);
    assert!(matches!(&orphans[0], GenrelayError::AssociationTimeout { prompt } if prompt == "cat"));
    assert_eq!(reconciler.stats().parked, 0);

    let id = new_message(store.as_ref()).await;
    let outcome = reconciler
        .associate_from_cache(&coord, id, &key)
        .await
        .unwrap();
    assert_eq!(outcome, Some(AssociationOutcome::Inserted));
    assert_eq!(
        store.find_associations(id).await.unwrap()[0].artifact_ref.as_str(),
        "mem://cat"
    );

    let missing = PromptDescriptor::new("dog").key();
    assert!(reconciler
        .associate_from_cache(&coord, id, &missing)
        .await
        .unwrap()
        .is_none());
}

// ---------------------------------------------------------------------------
// Driven by coordinator notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_watch_resolves_claims_from_coordinator_events() {
    let store = Arc::new(InMemoryMessageStore::new());
    let reconciler = Arc::new(PersistenceReconciler::new(
        store.clone(),
        &ReconcilerConfig::default(),
    ));
    let coord = GenerationCoordinator::new(Arc::new(EchoGenerator), &CoordinatorConfig::default());
    let watcher = reconciler.clone().watch(coord.subscribe());

    let identity = MessageIdentity::ephemeral();
    let key = PromptDescriptor::new("cat").key();
    reconciler.expect_artifact(identity, &key);
    coord.request(PromptDescriptor::new("cat")).await.unwrap();

    while reconciler.stats().parked == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(reconciler.stats().claims, 0);

    let id = new_message(store.as_ref()).await;
    reconciler
        .on_identity_promoted(identity.token().unwrap(), id)
        .await
        .unwrap();
    assert_eq!(store.find_associations(id).await.unwrap().len(), 1);

    drop(coord);
    tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
}
