use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genrelay_core::association::upsert_into;
use genrelay_core::{
    ArtifactAssociation, GenrelayError, GenrelayResult, Message, Role, StoreId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A message as persisted, with the artifacts linked to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: StoreId,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub associations: Vec<ArtifactAssociation>,
}

impl StoredMessage {
    fn from_message(id: StoreId, message: &Message) -> Self {
        Self {
            id,
            session_id: message.session_id,
            role: message.role,
            content: message.content.clone(),
            created_at: message.timestamp,
            associations: Vec::new(),
        }
    }
}

/// Durable store for finished messages and their artifact associations.
///
/// `upsert_association` replaces the row with the same prompt or appends a
/// new one. Implementations are not required to make it atomic with respect
/// to other writes on the same message; callers that can race (the
/// reconciler) serialize per [`StoreId`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a finished message and assign its permanent id.
    ///
    /// Fails if the message already carries a permanent identity.
    async fn create_message(&self, message: &Message) -> GenrelayResult<StoreId>;
    async fn get_message(&self, id: StoreId) -> GenrelayResult<Option<StoredMessage>>;
    async fn find_associations(&self, id: StoreId) -> GenrelayResult<Vec<ArtifactAssociation>>;
    async fn upsert_association(&self, association: &ArtifactAssociation) -> GenrelayResult<()>;
}

fn ensure_unsaved(message: &Message) -> GenrelayResult<()> {
    match message.identity.store_id() {
        Some(id) => Err(GenrelayError::Identity(format!(
            "message is already stored as {id}"
        ))),
        None => Ok(()),
    }
}

fn unknown_message(id: StoreId) -> GenrelayError {
    GenrelayError::Store(format!("no message with id {id}"))
}

/// In-memory store for tests and single-process deployments.
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<StoreId, StoredMessage>>,
    next_id: AtomicU64,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, message: &Message) -> GenrelayResult<StoreId> {
        ensure_unsaved(message)?;
        let id = StoreId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages
            .write()
            .await
            .insert(id, StoredMessage::from_message(id, message));
        Ok(id)
    }

    async fn get_message(&self, id: StoreId) -> GenrelayResult<Option<StoredMessage>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn find_associations(&self, id: StoreId) -> GenrelayResult<Vec<ArtifactAssociation>> {
        Ok(self
            .messages
            .read()
            .await
            .get(&id)
            .map(|m| m.associations.clone())
            .unwrap_or_default())
    }

    async fn upsert_association(&self, association: &ArtifactAssociation) -> GenrelayResult<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&association.store_id)
            .ok_or_else(|| unknown_message(association.store_id))?;
        upsert_into(&mut message.associations, association.clone());
        Ok(())
    }
}

/// File-based store: one JSON document per message.
pub struct FileMessageStore {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl FileMessageStore {
    /// Open (or create) a store in `dir`, continuing after the highest id on disk.
    pub async fn new(dir: PathBuf) -> GenrelayResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut highest = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = stem.parse::<u64>() {
                        highest = highest.max(id);
                    }
                }
            }
        }

        Ok(Self {
            dir,
            next_id: AtomicU64::new(highest + 1),
        })
    }

    fn message_path(&self, id: StoreId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, message: &StoredMessage) -> GenrelayResult<()> {
        let path = self.message_path(message.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(message)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn create_message(&self, message: &Message) -> GenrelayResult<StoreId> {
        ensure_unsaved(message)?;
        let id = StoreId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.write(&StoredMessage::from_message(id, message)).await?;
        Ok(id)
    }

    async fn get_message(&self, id: StoreId) -> GenrelayResult<Option<StoredMessage>> {
        let path = self.message_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let message: StoredMessage = serde_json::from_str(&data)
            .map_err(|e| GenrelayError::Store(format!("Failed to parse message {id}: {e}")))?;
        Ok(Some(message))
    }

    async fn find_associations(&self, id: StoreId) -> GenrelayResult<Vec<ArtifactAssociation>> {
        Ok(self
            .get_message(id)
            .await?
            .map(|m| m.associations)
            .unwrap_or_default())
    }

    async fn upsert_association(&self, association: &ArtifactAssociation) -> GenrelayResult<()> {
        let mut message = self
            .get_message(association.store_id)
            .await?
            .ok_or_else(|| unknown_message(association.store_id))?;
        upsert_into(&mut message.associations, association.clone());
        self.write(&message).await
    }
}
