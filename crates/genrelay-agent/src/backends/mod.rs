pub mod openai;

use async_trait::async_trait;
use crate::stream::ChunkEvent;
use crate::tools::ToolDescriptor;
use genrelay_core::{GenrelayResult, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use openai::OpenAiBackend;

/// Trait for streaming model providers.
///
/// A backend turns a conversation into a [`ProviderStream`] of normalized
/// [`ChunkEvent`]s. Everything vendor-specific (SSE framing, field names,
/// finish reasons) stays inside the implementation.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn chat_stream(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> GenrelayResult<ProviderStream>;
}

/// Receiving end of one upstream response.
///
/// The reader task is aborted when the stream is dropped, so a consumer that
/// stops early never leaves a request running.
pub struct ProviderStream {
    events: mpsc::Receiver<GenrelayResult<ChunkEvent>>,
    task: Option<JoinHandle<()>>,
}

impl ProviderStream {
    pub fn new(events: mpsc::Receiver<GenrelayResult<ChunkEvent>>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the upstream is exhausted.
    pub async fn recv(&mut self) -> Option<GenrelayResult<ChunkEvent>> {
        self.events.recv().await
    }

    pub fn abort(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ProviderStream {
    fn drop(&mut self) {
        self.abort();
    }
}
