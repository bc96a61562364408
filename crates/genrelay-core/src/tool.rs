use serde::{Deserialize, Serialize};

/// A tool invocation reassembled from a stream.
///
/// `arguments_json` is the exact concatenation of every argument fragment the
/// provider sent for this call; `arguments` is its parsed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Position of the call within its stream.
    pub index: u32,
    /// Name of the tool to invoke.
    pub name: String,
    /// Raw argument text as received.
    pub arguments_json: String,
    /// Parsed arguments.
    pub arguments: serde_json::Value,
}

/// The result returned after executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Index of the [`ToolCall`] this result corresponds to.
    pub index: u32,
    /// Name of the tool that produced it.
    pub name: String,
    /// Structured output produced by the tool.
    pub content: serde_json::Value,
    /// Whether the tool execution ended in an error.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(call: &ToolCall, content: serde_json::Value) -> Self {
        Self {
            index: call.index,
            name: call.name.clone(),
            content,
            is_error: false,
        }
    }

    /// Creates an error tool result.
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            index: call.index,
            name: call.name.clone(),
            content: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}
