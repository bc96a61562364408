//! Bridges generated artifacts and permanent message identities.
//!
//! An artifact can become Ready while the message that asked for it is still
//! ephemeral (the turn has not finished, or its store write is in flight).
//! The reconciler parks such artifacts under the message's ephemeral token
//! and writes the association once the token is promoted, or immediately if
//! the promotion was seen first. Both halves are kept only for a bounded
//! window; anything older is dropped as orphaned.

use crate::store::MessageStore;
use genrelay_core::{
    ArtifactAssociation, ArtifactRef, EphemeralToken, GenrelayError, GenrelayResult,
    MessageIdentity, StoreId,
};
use genrelay_generation::{GenerationCoordinator, GenerationEvent, GenerationKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tuning for [`PersistenceReconciler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How long an artifact waits for its message to be promoted.
    #[serde(default = "default_orphan_timeout_secs")]
    pub orphan_timeout_secs: u64,
    /// How often [`PersistenceReconciler::watch`] sweeps expired entries.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_orphan_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            orphan_timeout_secs: default_orphan_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// What an association attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOutcome {
    /// A new row was appended.
    Inserted,
    /// The existing row for the prompt got a new artifact ref.
    Updated,
    /// The row already held this artifact ref.
    Unchanged,
    /// The owner is still ephemeral; the artifact waits for promotion.
    Parked,
}

/// Sizes of the reconciler's in-memory tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcilerStats {
    pub claims: usize,
    pub parked: usize,
    pub promoted: usize,
}

struct Claim {
    owner: MessageIdentity,
    claimed_at: Instant,
}

struct ParkedArtifact {
    prompt: String,
    artifact_ref: ArtifactRef,
    parked_at: Instant,
}

struct Promotion {
    store_id: StoreId,
    promoted_at: Instant,
}

#[derive(Default)]
struct Tables {
    claims: HashMap<GenerationKey, Vec<Claim>>,
    parked: HashMap<EphemeralToken, Vec<ParkedArtifact>>,
    promoted: HashMap<EphemeralToken, Promotion>,
}

/// Performs idempotent artifact associations once both halves are known.
pub struct PersistenceReconciler {
    store: Arc<dyn MessageStore>,
    tables: Mutex<Tables>,
    store_locks: Mutex<HashMap<StoreId, Arc<tokio::sync::Mutex<()>>>>,
    orphan_timeout: Duration,
    sweep_interval: Duration,
}

impl PersistenceReconciler {
    pub fn new(store: Arc<dyn MessageStore>, config: &ReconcilerConfig) -> Self {
        Self {
            store,
            tables: Mutex::new(Tables::default()),
            store_locks: Mutex::new(HashMap::new()),
            orphan_timeout: Duration::from_secs(config.orphan_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    /// Record that `owner` wants the artifact for `key` once it is Ready.
    ///
    /// Claims are resolved by coordinator notifications fed through
    /// [`watch`](Self::watch) or [`handle_event`](Self::handle_event).
    pub fn expect_artifact(&self, owner: MessageIdentity, key: &GenerationKey) {
        let mut tables = self.tables.lock();
        let claims = tables.claims.entry(key.clone()).or_default();
        if !claims.iter().any(|c| c.owner == owner) {
            claims.push(Claim {
                owner,
                claimed_at: Instant::now(),
            });
            debug!(owner = %owner, key = %key, "Artifact claim registered");
        }
    }

    /// The artifact for `key` is Ready for `owner`.
    ///
    /// Associates right away when the owner is (or has been promoted to) a
    /// permanent identity, otherwise parks the artifact until promotion.
    pub async fn on_artifact_ready(
        &self,
        owner: MessageIdentity,
        key: &GenerationKey,
        artifact_ref: ArtifactRef,
    ) -> GenrelayResult<AssociationOutcome> {
        let store_id = {
            let mut tables = self.tables.lock();
            Self::drop_claim(&mut tables, key, owner);

            match owner {
                MessageIdentity::Permanent(id) => id,
                MessageIdentity::Ephemeral(token) => match tables.promoted.get(&token) {
                    Some(promotion) => promotion.store_id,
                    None => {
                        let parked = tables.parked.entry(token).or_default();
                        match parked.iter_mut().find(|p| p.prompt == key.prompt()) {
                            Some(existing) => {
                                existing.artifact_ref = artifact_ref;
                                existing.parked_at = Instant::now();
                            }
                            None => parked.push(ParkedArtifact {
                                prompt: key.prompt().to_string(),
                                artifact_ref,
                                parked_at: Instant::now(),
                            }),
                        }
                        debug!(token = %token, key = %key, "Artifact parked until promotion");
                        return Ok(AssociationOutcome::Parked);
                    }
                },
            }
        };

        self.associate(store_id, key.prompt(), artifact_ref).await
    }

    /// The message behind `token` was durably written as `store_id`.
    ///
    /// Associates every artifact parked for the token and remembers the
    /// promotion so artifacts arriving later associate directly. A repeated
    /// signal with the same id is harmless; a different id is rejected.
    /// Artifacts whose write fails stay parked for the next signal.
    /// Returns the number of parked artifacts that were associated.
    pub async fn on_identity_promoted(
        &self,
        token: EphemeralToken,
        store_id: StoreId,
    ) -> GenrelayResult<usize> {
        let drained = {
            let mut tables = self.tables.lock();
            if let Some(existing) = tables.promoted.get(&token) {
                if existing.store_id != store_id {
                    return Err(GenrelayError::Identity(format!(
                        "token {token} already promoted to {}, refusing {store_id}",
                        existing.store_id
                    )));
                }
            }
            tables.promoted.insert(
                token,
                Promotion {
                    store_id,
                    promoted_at: Instant::now(),
                },
            );
            tables.parked.remove(&token).unwrap_or_default()
        };

        info!(
            token = %token,
            store_id = %store_id,
            parked = drained.len(),
            "Identity promoted"
        );

        let mut associated = 0;
        let mut first_error = None;
        let mut failed = Vec::new();
        for artifact in drained {
            match self
                .associate(store_id, &artifact.prompt, artifact.artifact_ref.clone())
                .await
            {
                Ok(_) => associated += 1,
                Err(e) => {
                    warn!(store_id = %store_id, prompt = %artifact.prompt, error = %e, "Association failed, artifact stays parked");
                    first_error.get_or_insert(e);
                    failed.push(artifact);
                }
            }
        }

        if !failed.is_empty() {
            // Parked again with the original timestamp, so a retried
            // promotion can finish and the sweep still bounds the wait.
            let mut tables = self.tables.lock();
            let parked = tables.parked.entry(token).or_default();
            for artifact in failed {
                if !parked.iter().any(|p| p.prompt == artifact.prompt) {
                    parked.push(artifact);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(associated),
        }
    }

    /// Apply one coordinator notification to the outstanding claims.
    pub async fn handle_event(&self, event: &GenerationEvent) {
        let claims = self.tables.lock().claims.remove(event.key());
        let Some(claims) = claims else {
            return;
        };

        match event {
            GenerationEvent::Ready { key, artifact_ref } => {
                for claim in claims {
                    if let Err(e) = self
                        .on_artifact_ready(claim.owner, key, artifact_ref.clone())
                        .await
                    {
                        warn!(owner = %claim.owner, key = %key, error = %e, "Claimed association failed");
                    }
                }
            }
            GenerationEvent::Failed { key, error } => {
                debug!(key = %key, error = %error, claims = claims.len(), "Claims dropped after failed generation");
            }
        }
    }

    /// Write `(store_id, prompt) -> artifact_ref`, updating in place if the
    /// prompt is already linked to the message.
    ///
    /// The lookup and the write run under a per-message lock, so concurrent
    /// attempts for the same message never append duplicate prompts.
    pub async fn associate(
        &self,
        store_id: StoreId,
        prompt: &str,
        artifact_ref: ArtifactRef,
    ) -> GenrelayResult<AssociationOutcome> {
        let lock = {
            let mut locks = self.store_locks.lock();
            locks.entry(store_id).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            self.associate_locked(store_id, prompt, artifact_ref).await
        };

        drop(lock);
        self.release_store_lock(store_id);
        result
    }

    async fn associate_locked(
        &self,
        store_id: StoreId,
        prompt: &str,
        artifact_ref: ArtifactRef,
    ) -> GenrelayResult<AssociationOutcome> {
        let existing = self.store.find_associations(store_id).await?;
        let outcome = match existing.iter().find(|a| a.prompt == prompt) {
            Some(row) if row.artifact_ref == artifact_ref => return Ok(AssociationOutcome::Unchanged),
            Some(_) => AssociationOutcome::Updated,
            None => AssociationOutcome::Inserted,
        };

        self.store
            .upsert_association(&ArtifactAssociation::new(store_id, prompt, artifact_ref))
            .await?;

        info!(store_id = %store_id, prompt = %prompt, outcome = ?outcome, "Artifact associated");
        Ok(outcome)
    }

    fn release_store_lock(&self, store_id: StoreId) {
        let mut locks = self.store_locks.lock();
        if locks
            .get(&store_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&store_id);
        }
    }

    /// Re-attach an artifact that is still in the coordinator's cache.
    ///
    /// Returns `None` when the cache no longer holds a value for `key`.
    pub async fn associate_from_cache(
        &self,
        coordinator: &GenerationCoordinator,
        store_id: StoreId,
        key: &GenerationKey,
    ) -> GenrelayResult<Option<AssociationOutcome>> {
        match coordinator.peek(key) {
            Some(artifact_ref) => Ok(Some(self.associate(store_id, key.prompt(), artifact_ref).await?)),
            None => Ok(None),
        }
    }

    /// Drop everything older than the orphan timeout.
    pub fn sweep_expired(&self) -> Vec<GenrelayError> {
        self.sweep_expired_at(Instant::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit clock.
    ///
    /// Parked artifacts whose message never got promoted come back as
    /// [`GenrelayError::AssociationTimeout`]; they stay available from the
    /// coordinator cache for [`associate_from_cache`](Self::associate_from_cache).
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<GenrelayError> {
        let timeout = self.orphan_timeout;
        let expired = |since: Instant| now.saturating_duration_since(since) >= timeout;
        let mut orphans = Vec::new();

        let mut tables = self.tables.lock();

        tables.parked.retain(|token, artifacts| {
            artifacts.retain(|artifact| {
                if expired(artifact.parked_at) {
                    warn!(
                        token = %token,
                        prompt = %artifact.prompt,
                        artifact = %artifact.artifact_ref,
                        "Identity never promoted, dropping parked artifact"
                    );
                    orphans.push(GenrelayError::AssociationTimeout {
                        prompt: artifact.prompt.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            !artifacts.is_empty()
        });

        tables.claims.retain(|key, claims| {
            claims.retain(|claim| {
                let keep = !expired(claim.claimed_at);
                if !keep {
                    debug!(key = %key, owner = %claim.owner, "Expired artifact claim dropped");
                }
                keep
            });
            !claims.is_empty()
        });

        tables
            .promoted
            .retain(|_, promotion| !expired(promotion.promoted_at));

        orphans
    }

    pub fn stats(&self) -> ReconcilerStats {
        let tables = self.tables.lock();
        ReconcilerStats {
            claims: tables.claims.values().map(Vec::len).sum(),
            parked: tables.parked.values().map(Vec::len).sum(),
            promoted: tables.promoted.len(),
        }
    }

    /// Follow coordinator notifications and sweep orphans periodically.
    ///
    /// The task ends when the coordinator's channel closes.
    pub fn watch(self: Arc<Self>, mut events: broadcast::Receiver<GenerationEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(self.sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => self.handle_event(&event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Reconciler lagged behind generation events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => {
                        let orphans = self.sweep_expired();
                        if !orphans.is_empty() {
                            info!(orphans = orphans.len(), "Reconciler sweep dropped orphaned artifacts");
                        }
                    }
                }
            }

            debug!("Reconciler watch loop finished");
        })
    }

    fn drop_claim(tables: &mut Tables, key: &GenerationKey, owner: MessageIdentity) {
        if let Some(claims) = tables.claims.get_mut(key) {
            claims.retain(|c| c.owner != owner);
            if claims.is_empty() {
                tables.claims.remove(key);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use genrelay_core::Message;
    use genrelay_generation::PromptDescriptor;
    use uuid::Uuid;

    async fn setup() -> (PersistenceReconciler, Arc<InMemoryMessageStore>, StoreId) {
        let store = Arc::new(InMemoryMessageStore::new());
        let id = store
            .create_message(&Message::assistant("here you go", Uuid::new_v4()))
            .await
            .unwrap();
        let reconciler = PersistenceReconciler::new(store.clone(), &ReconcilerConfig::default());
        (reconciler, store, id)
    }

    fn key(prompt: &str) -> GenerationKey {
        PromptDescriptor::new(prompt).key()
    }

    #[tokio::test]
    async fn test_permanent_owner_associates_immediately() {
        let (reconciler, store, id) = setup().await;
        let outcome = reconciler
            .on_artifact_ready(MessageIdentity::Permanent(id), &key("cat"), ArtifactRef::new("r"))
            .await
            .unwrap();
        assert_eq!(outcome, AssociationOutcome::Inserted);
        assert_eq!(store.find_associations(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artifact_before_promotion_is_parked() {
        let (reconciler, store, id) = setup().await;
        let token = EphemeralToken::new();

        let outcome = reconciler
            .on_artifact_ready(MessageIdentity::Ephemeral(token), &key("cat"), ArtifactRef::new("r"))
            .await
            .unwrap();
        assert_eq!(outcome, AssociationOutcome::Parked);
        assert!(store.find_associations(id).await.unwrap().is_empty());
        assert_eq!(reconciler.stats().parked, 1);

        assert_eq!(reconciler.on_identity_promoted(token, id).await.unwrap(), 1);
        assert_eq!(reconciler.stats().parked, 0);
        assert_eq!(store.find_associations(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_before_artifact_associates_directly() {
        let (reconciler, store, id) = setup().await;
        let token = EphemeralToken::new();

        assert_eq!(reconciler.on_identity_promoted(token, id).await.unwrap(), 0);
        let outcome = reconciler
            .on_artifact_ready(MessageIdentity::Ephemeral(token), &key("cat"), ArtifactRef::new("r"))
            .await
            .unwrap();
        assert_eq!(outcome, AssociationOutcome::Inserted);
        assert_eq!(store.find_associations(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_promotion_rejected() {
        let (reconciler, _store, id) = setup().await;
        let token = EphemeralToken::new();
        reconciler.on_identity_promoted(token, id).await.unwrap();
        reconciler.on_identity_promoted(token, id).await.unwrap();

        let err = reconciler
            .on_identity_promoted(token, StoreId(id.0 + 100))
            .await
            .unwrap_err();
        assert!(matches!(err, GenrelayError::Identity(_)));
    }

    #[tokio::test]
    async fn test_repeat_association_is_unchanged_then_updated() {
        let (reconciler, store, id) = setup().await;
        let first = reconciler.associate(id, "cat", ArtifactRef::new("r1")).await.unwrap();
        let again = reconciler.associate(id, "cat", ArtifactRef::new("r1")).await.unwrap();
        let newer = reconciler.associate(id, "cat", ArtifactRef::new("r2")).await.unwrap();

        assert_eq!(first, AssociationOutcome::Inserted);
        assert_eq!(again, AssociationOutcome::Unchanged);
        assert_eq!(newer, AssociationOutcome::Updated);

        let rows = store.find_associations(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].artifact_ref.as_str(), "r2");
    }

    #[tokio::test]
    async fn test_store_locks_are_released() {
        let (reconciler, _store, id) = setup().await;
        reconciler.associate(id, "cat", ArtifactRef::new("r")).await.unwrap();
        assert!(reconciler.store_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_drops_unpromoted_artifacts() {
        let (reconciler, _store, _id) = setup().await;
        let token = EphemeralToken::new();
        reconciler
            .on_artifact_ready(MessageIdentity::Ephemeral(token), &key("cat"), ArtifactRef::new("r"))
            .await
            .unwrap();
        reconciler.expect_artifact(MessageIdentity::ephemeral(), &key("dog"));

        assert!(reconciler.sweep_expired().is_empty());

        let later = Instant::now() + Duration::from_secs(301);
        let orphans = reconciler.sweep_expired_at(later);
        assert_eq!(orphans.len(), 1);
        assert!(matches!(
            &orphans[0],
            GenrelayError::AssociationTimeout { prompt } if prompt == "cat"
        ));
        assert_eq!(reconciler.stats(), ReconcilerStats::default());
    }

    #[tokio::test]
    async fn test_failed_event_drops_claims() {
        let (reconciler, _store, _id) = setup().await;
        reconciler.expect_artifact(MessageIdentity::ephemeral(), &key("cat"));
        assert_eq!(reconciler.stats().claims, 1);

        reconciler
            .handle_event(&GenerationEvent::Failed {
                key: key("cat"),
                error: genrelay_core::GenerationError::Failed("x".into()),
            })
            .await;
        assert_eq!(reconciler.stats().claims, 0);
    }

    /// Fails the first `upsert_association`, then delegates.
    struct FlakyStore {
        inner: InMemoryMessageStore,
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl MessageStore for FlakyStore {
        async fn create_message(&self, message: &Message) -> GenrelayResult<StoreId> {
            self.inner.create_message(message).await
        }

        async fn get_message(
            &self,
            id: StoreId,
        ) -> GenrelayResult<Option<crate::store::StoredMessage>> {
            self.inner.get_message(id).await
        }

        async fn find_associations(&self, id: StoreId) -> GenrelayResult<Vec<ArtifactAssociation>> {
            self.inner.find_associations(id).await
        }

        async fn upsert_association(&self, association: &ArtifactAssociation) -> GenrelayResult<()> {
            if !self
                .failed_once
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(GenrelayError::Store("disk unavailable".into()));
            }
            self.inner.upsert_association(association).await
        }
    }

    #[tokio::test]
    async fn test_failed_promotion_write_keeps_artifact_for_retry() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryMessageStore::new(),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        });
        let id = store
            .create_message(&Message::assistant("here you go", Uuid::new_v4()))
            .await
            .unwrap();
        let reconciler = PersistenceReconciler::new(store.clone(), &ReconcilerConfig::default());
        let token = EphemeralToken::new();

        reconciler
            .on_artifact_ready(MessageIdentity::Ephemeral(token), &key("cat"), ArtifactRef::new("r"))
            .await
            .unwrap();

        let err = reconciler.on_identity_promoted(token, id).await.unwrap_err();
        assert!(matches!(err, GenrelayError::Store(_)));
        assert_eq!(reconciler.stats().parked, 1);
        assert!(store.find_associations(id).await.unwrap().is_empty());

        assert_eq!(reconciler.on_identity_promoted(token, id).await.unwrap(), 1);
        assert_eq!(reconciler.stats().parked, 0);
        let rows = store.find_associations(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].artifact_ref.as_str(), "r");
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: ReconcilerConfig = toml::from_str("").unwrap();
        assert_eq!(config.orphan_timeout_secs, 300);
        assert_eq!(config.sweep_interval_secs, 30);

        let config: ReconcilerConfig = toml::from_str("orphan_timeout_secs = 60").unwrap();
        assert_eq!(config.orphan_timeout_secs, 60);
        assert_eq!(config.sweep_interval_secs, 30);
    }
}
