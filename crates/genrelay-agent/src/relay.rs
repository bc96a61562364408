//! One streaming turn, from provider chunks to a stored assistant message.

use crate::accumulator::ToolCallAccumulator;
use crate::backends::{LlmBackend, ProviderStream};
use crate::config::RelayConfig;
use crate::stream::{ChunkEvent, FinishReason, RelayEvent};
use crate::tools::{ToolContext, ToolRegistry};
use genrelay_core::{GenrelayError, Message, MessageIdentity, StoreId};
use genrelay_session::{MessageStore, PersistenceReconciler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default = "Uuid::new_v4")]
    pub session_id: Uuid,
    /// The user's new message.
    pub content: String,
    /// Earlier messages of the conversation, oldest first.
    #[serde(default)]
    pub history: Vec<Message>,
}

impl Turn {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            content: content.into(),
            history: Vec::new(),
        }
    }
}

/// How a turn ended, as seen by whoever awaits the relay task.
#[derive(Debug)]
pub enum RelayOutcome {
    Completed { store_id: StoreId, text: String },
    Failed(GenrelayError),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Open,
    Finalizing,
    Closed,
}

/// Caller side of a running turn.
///
/// Dropping the handle (or just its event receiver) cancels the turn the
/// same way [`RelayHandle::cancel`] does.
pub struct RelayHandle {
    events: mpsc::Receiver<RelayEvent>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<RelayOutcome>,
}

impl RelayHandle {
    /// Next downstream event, or `None` once the turn has ended.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Ask the turn to stop. Nothing from it will be stored.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Drain the remaining events and wait for the outcome.
    pub async fn finish(mut self) -> (Vec<RelayEvent>, RelayOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.task.await.unwrap_or_else(|e| {
            RelayOutcome::Failed(GenrelayError::Upstream(format!("relay task failed: {e}")))
        });
        (events, outcome)
    }
}

enum Interrupt<T> {
    Cancelled,
    Ready(T),
}

/// Drives streaming turns.
///
/// Content deltas are forwarded as they arrive. Tool call fragments are
/// buffered until the provider's finish marker, then every call is parsed
/// before any of them runs, so a malformed call means nothing executes.
/// Only a turn that fully succeeds is written to the store.
#[derive(Clone)]
pub struct StreamRelay {
    backend: Arc<dyn LlmBackend>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn MessageStore>,
    reconciler: Arc<PersistenceReconciler>,
    config: RelayConfig,
}

impl StreamRelay {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn MessageStore>,
        reconciler: Arc<PersistenceReconciler>,
        config: RelayConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            store,
            reconciler,
            config,
        }
    }

    /// Start a turn on the runtime and return its handle.
    pub fn start(&self, turn: Turn) -> RelayHandle {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let relay = self.clone();
        let task = tokio::spawn(async move { relay.run(turn, tx, cancel_rx).await });

        RelayHandle {
            events: rx,
            cancel: Some(cancel_tx),
            task,
        }
    }

    async fn run(
        self,
        turn: Turn,
        tx: mpsc::Sender<RelayEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> RelayOutcome {
        let mut identity = MessageIdentity::ephemeral();
        let session_id = turn.session_id;
        let mut messages = turn.history;
        messages.push(Message::user(turn.content, session_id));
        let descriptors = self.tools.descriptors();

        let mut state = RelayState::Open;
        info!(session_id = %session_id, owner = %identity, state = ?state, "Turn started");

        let opened = interruptible(
            &mut cancel,
            &tx,
            self.backend.chat_stream(
                Some(self.config.system_prompt.as_str()),
                &messages,
                &descriptors,
            ),
        )
        .await;
        let mut upstream = match opened {
            Interrupt::Cancelled => return cancelled(session_id, state, None),
            Interrupt::Ready(Ok(stream)) => stream,
            Interrupt::Ready(Err(e)) => return fail(&mut cancel, &tx, session_id, state, e).await,
        };

        let mut text = String::new();
        let mut accumulator = ToolCallAccumulator::new();

        let finish = loop {
            let next = match interruptible(&mut cancel, &tx, upstream.recv()).await {
                Interrupt::Cancelled => return cancelled(session_id, state, Some(upstream)),
                Interrupt::Ready(next) => next,
            };

            match next {
                None => {
                    let e = GenrelayError::Upstream("stream ended without a finish marker".into());
                    return fail(&mut cancel, &tx, session_id, state, e).await;
                }
                Some(Err(e)) => return fail(&mut cancel, &tx, session_id, state, e).await,
                Some(Ok(ChunkEvent::ContentDelta(delta))) => {
                    text.push_str(&delta);
                    if !emit(&mut cancel, &tx, RelayEvent::Content { delta }).await {
                        return cancelled(session_id, state, Some(upstream));
                    }
                }
                Some(Ok(ChunkEvent::ToolCallFragments(fragments))) => {
                    for fragment in fragments {
                        let index = fragment.index;
                        if accumulator.accept(fragment)
                            && !emit(&mut cancel, &tx, RelayEvent::ToolInProgress { index }).await
                        {
                            return cancelled(session_id, state, Some(upstream));
                        }
                    }
                }
                Some(Ok(ChunkEvent::Finished(reason))) => break reason,
            }
        };

        drop(upstream);
        state = RelayState::Finalizing;
        debug!(session_id = %session_id, state = ?state, reason = ?finish, "Finish marker received");

        if let FinishReason::Error(message) = finish {
            let e = GenrelayError::Upstream(message);
            return fail(&mut cancel, &tx, session_id, state, e).await;
        }

        let calls = match accumulator.finalize_all() {
            Ok(calls) => calls,
            Err(e) => return fail(&mut cancel, &tx, session_id, state, e).await,
        };

        let ctx = ToolContext {
            identity,
            session_id,
        };
        for call in calls {
            info!(session_id = %session_id, tool = %call.name, index = call.index, "Executing tool call");
            let result = match interruptible(&mut cancel, &tx, self.tools.execute(&call, &ctx)).await
            {
                Interrupt::Cancelled => return cancelled(session_id, state, None),
                Interrupt::Ready(result) => result,
            };
            match result {
                Ok(result) => {
                    let event = RelayEvent::ToolResult {
                        name: result.name,
                        result: result.content,
                    };
                    if !emit(&mut cancel, &tx, event).await {
                        return cancelled(session_id, state, None);
                    }
                }
                Err(e) => return fail(&mut cancel, &tx, session_id, state, e).await,
            }
        }

        if cancel_requested(&mut cancel) || tx.is_closed() {
            return cancelled(session_id, state, None);
        }

        let mut message = Message::assistant(text.clone(), session_id);
        message.identity = identity;
        let store_id = match self.store.create_message(&message).await {
            Ok(id) => id,
            Err(e) => return fail(&mut cancel, &tx, session_id, state, e).await,
        };

        if let Some(token) = identity.token() {
            if let Err(e) = self.reconciler.on_identity_promoted(token, store_id).await {
                warn!(store_id = %store_id, error = %e, "Artifact association after promotion failed");
            }
        }
        match identity.promote(store_id) {
            Ok(permanent) => identity = permanent,
            Err(e) => warn!(store_id = %store_id, error = %e, "Turn identity was already permanent"),
        }

        // The message is durable at this point; a caller that has gone away
        // simply misses the terminal event.
        emit(&mut cancel, &tx, RelayEvent::Done { final_id: store_id }).await;
        state = RelayState::Closed;
        info!(session_id = %session_id, owner = %identity, state = ?state, "Turn completed");

        RelayOutcome::Completed { store_id, text }
    }
}

/// Await `fut` unless the caller cancels or stops listening first.
async fn interruptible<F: std::future::Future>(
    cancel: &mut oneshot::Receiver<()>,
    tx: &mpsc::Sender<RelayEvent>,
    fut: F,
) -> Interrupt<F::Output> {
    tokio::select! {
        biased;
        _ = cancel => Interrupt::Cancelled,
        _ = tx.closed() => Interrupt::Cancelled,
        out = fut => Interrupt::Ready(out),
    }
}

/// Send one event downstream. A full buffer does not hide a cancel.
///
/// Returns `false` when the turn was cancelled or the receiver is gone.
async fn emit(
    cancel: &mut oneshot::Receiver<()>,
    tx: &mpsc::Sender<RelayEvent>,
    event: RelayEvent,
) -> bool {
    matches!(
        interruptible(cancel, tx, tx.send(event)).await,
        Interrupt::Ready(Ok(()))
    )
}

fn cancel_requested(cancel: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        cancel.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

fn cancelled(session_id: Uuid, from: RelayState, upstream: Option<ProviderStream>) -> RelayOutcome {
    if let Some(mut upstream) = upstream {
        upstream.abort();
    }
    info!(session_id = %session_id, from = ?from, state = ?RelayState::Closed, "Turn cancelled, nothing stored");
    RelayOutcome::Cancelled
}

async fn fail(
    cancel: &mut oneshot::Receiver<()>,
    tx: &mpsc::Sender<RelayEvent>,
    session_id: Uuid,
    from: RelayState,
    error: GenrelayError,
) -> RelayOutcome {
    warn!(session_id = %session_id, from = ?from, error = %error, "Turn failed, nothing stored");
    let event = RelayEvent::Error {
        message: error.to_string(),
    };
    emit(cancel, tx, event).await;
    RelayOutcome::Failed(error)
}
