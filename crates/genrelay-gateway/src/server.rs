use crate::connection::{Connection, ConnectionManager};
use crate::router::{MessageRouter, ServerFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use genrelay_agent::StreamRelay;
use genrelay_core::StoreId;
use genrelay_generation::{GenerationCoordinator, GenerationKey};
use genrelay_session::MessageStore;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: GenerationCoordinator,
    pub store: Arc<dyn MessageStore>,
}

/// The main gateway server.
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(
        relay: StreamRelay,
        coordinator: GenerationCoordinator,
        store: Arc<dyn MessageStore>,
    ) -> Router {
        let connections = ConnectionManager::new();
        let router = Arc::new(MessageRouter::new(relay, connections.clone()));

        let state = Arc::new(AppState {
            router,
            connections,
            coordinator,
            store,
        });

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/artifacts", get(artifact_handler))
            .route("/messages/{id}", get(message_handler))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.coordinator.stats();
    Json(serde_json::json!({
        "status": "ok",
        "service": "genrelay",
        "connections": state.connections.connection_count().await,
        "cached_artifacts": stats.cached,
        "cache_capacity": stats.capacity,
        "pending_generations": stats.pending,
    }))
}

#[derive(Debug, Deserialize)]
struct ArtifactQuery {
    prompt: String,
    style: Option<String>,
}

async fn artifact_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArtifactQuery>,
) -> impl IntoResponse {
    let key = GenerationKey::new(&query.prompt, query.style.as_deref());
    match state.coordinator.peek(&key) {
        Some(artifact_ref) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "prompt": key.prompt(),
                "style": key.style(),
                "artifact_ref": artifact_ref,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no cached artifact for '{key}'")})),
        ),
    }
}

async fn message_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.store.get_message(StoreId(id)).await {
        Ok(Some(message)) => (StatusCode::OK, Json(serde_json::json!(message))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no message with id {id}")})),
        ),
        Err(e) => {
            error!(id, error = %e, "Message lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let connection_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages back to the WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state
        .connections
        .add(Connection {
            id: connection_id,
            session_id,
            tx,
        })
        .await;

    info!(
        connection_id = %connection_id,
        session_id = %session_id,
        "WebSocket connected"
    );

    let welcome = ServerFrame::Connected {
        session_id,
        connection_id,
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        state.connections.send_to(connection_id, &json).await;
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // The active turn lives in this task; leaving the loop drops it, which
    // cancels the turn.
    let mut active = None;
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state
                        .router
                        .handle_text(&text, connection_id, session_id, &mut active)
                        .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(connection_id = %connection_id, error = %e, "WebSocket read error");
                    break;
                }
            },
        }
    }

    drop(active);
    state.connections.remove(connection_id).await;
    send_task.abort();
    info!(connection_id = %connection_id, "WebSocket disconnected");
}
