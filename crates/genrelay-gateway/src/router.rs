use crate::connection::ConnectionManager;
use genrelay_agent::{RelayHandle, StreamRelay, Turn};
use genrelay_core::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames a client sends over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start a turn.
    Turn {
        session_id: Option<Uuid>,
        content: String,
        #[serde(default)]
        history: Vec<Message>,
    },
    /// Stop the turn in progress.
    Cancel,
}

/// Frames the gateway sends besides relay events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected { session_id: Uuid, connection_id: Uuid },
    Rejected { message: String },
}

/// The turn currently running for one connection.
pub struct ActiveTurn {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ActiveTurn {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        // Dropping the relay handle inside the task cancels the turn.
        self.task.abort();
    }
}

/// Routes client frames of one connection to the relay.
pub struct MessageRouter {
    relay: StreamRelay,
    connections: Arc<ConnectionManager>,
}

impl MessageRouter {
    pub fn new(relay: StreamRelay, connections: Arc<ConnectionManager>) -> Self {
        Self { relay, connections }
    }

    /// Apply one text frame. At most one turn runs per connection.
    pub async fn handle_text(
        &self,
        text: &str,
        connection_id: Uuid,
        default_session: Uuid,
        active: &mut Option<ActiveTurn>,
    ) {
        if active.as_ref().is_some_and(ActiveTurn::is_finished) {
            *active = None;
        }

        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Unreadable client frame");
                self.reject(connection_id, format!("invalid frame: {e}")).await;
                return;
            }
        };

        match frame {
            ClientFrame::Cancel => match active.as_mut() {
                Some(turn) => {
                    info!(connection_id = %connection_id, "Cancelling active turn");
                    turn.cancel();
                }
                None => debug!(connection_id = %connection_id, "Cancel without an active turn"),
            },
            ClientFrame::Turn {
                session_id,
                content,
                history,
            } => {
                if active.is_some() {
                    self.reject(connection_id, "a turn is already in progress".into())
                        .await;
                    return;
                }

                let turn = Turn {
                    session_id: session_id.unwrap_or(default_session),
                    content,
                    history,
                };
                info!(connection_id = %connection_id, session_id = %turn.session_id, "Routing turn to relay");
                let handle = self.relay.start(turn);
                *active = Some(self.forward(handle, connection_id));
            }
        }
    }

    fn forward(&self, mut handle: RelayHandle, connection_id: Uuid) -> ActiveTurn {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let connections = self.connections.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        handle.cancel();
                        break;
                    }
                    event = handle.next_event() => event,
                };
                let Some(event) = event else { break };

                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode relay event");
                        continue;
                    }
                };
                if !connections.send_to(connection_id, &json).await {
                    handle.cancel();
                    break;
                }
            }

            let (_, outcome) = handle.finish().await;
            debug!(connection_id = %connection_id, outcome = ?outcome, "Turn forwarder finished");
        });

        ActiveTurn {
            cancel: Some(cancel_tx),
            task,
        }
    }

    async fn reject(&self, connection_id: Uuid, message: String) {
        if let Ok(json) = serde_json::to_string(&ServerFrame::Rejected { message }) {
            self.connections.send_to(connection_id, &json).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"turn","content":"draw a cat"}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Turn { session_id: None, ref content, .. } if content == "draw a cat"
        ));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Cancel));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn test_server_frame_shape() {
        let json = serde_json::to_value(ServerFrame::Rejected {
            message: "busy".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "rejected", "message": "busy"}));
    }
}
