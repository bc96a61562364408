use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A connected WebSocket client.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub session_id: Uuid,
    pub tx: mpsc::UnboundedSender<String>,
}

/// Active WebSocket connections, for outbound frames and diagnostics.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, conn: Connection) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(connection_id = %id, "Connection added");
    }

    pub async fn remove(&self, id: Uuid) {
        self.connections.write().await.remove(&id);
        tracing::info!(connection_id = %id, "Connection removed");
    }

    /// Queue a text frame for one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, id: Uuid, message: &str) -> bool {
        match self.connections.read().await.get(&id) {
            Some(conn) => conn.tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_known_and_unknown_connection() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        manager
            .add(Connection {
                id,
                session_id: Uuid::new_v4(),
                tx,
            })
            .await;

        assert!(manager.send_to(id, "hello").await);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(!manager.send_to(Uuid::new_v4(), "lost").await);

        manager.remove(id).await;
        assert_eq!(manager.connection_count().await, 0);
    }
}
