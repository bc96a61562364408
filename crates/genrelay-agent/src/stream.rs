use genrelay_core::StoreId;
use serde::{Deserialize, Serialize};

/// Why the provider ended a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    /// Truncated by the provider's output limit. Still a completed turn.
    Length,
    Error(String),
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            other => Self::Error(format!("provider finished with '{other}'")),
        }
    }
}

/// One piece of a tool invocation as it arrives on the wire.
///
/// `arguments_chunk` is an arbitrary substring of the call's JSON arguments;
/// it only means something once every chunk for the same `index` has been
/// concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments_chunk: Option<String>,
}

impl ToolCallFragment {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            name: None,
            arguments_chunk: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, chunk: impl Into<String>) -> Self {
        self.arguments_chunk = Some(chunk.into());
        self
    }
}

/// Normalized event decoded from a provider's streaming response.
///
/// Order is significant and is preserved end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    ContentDelta(String),
    ToolCallFragments(Vec<ToolCallFragment>),
    Finished(FinishReason),
}

/// Events sent to the downstream caller during a turn.
///
/// Every turn that is not cancelled ends with exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A chunk of assistant text, forwarded as soon as it arrives.
    Content { delta: String },

    /// The model started a tool call at this index.
    ToolInProgress { index: u32 },

    /// A tool call finished executing.
    ToolResult {
        name: String,
        result: serde_json::Value,
    },

    /// The turn completed and the assistant message was stored.
    Done { final_id: StoreId },

    /// The turn failed; nothing was stored.
    Error { message: String },
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
