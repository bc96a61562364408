//! Tools the model can invoke during a turn.

pub mod image;

use async_trait::async_trait;
use genrelay_core::{GenrelayResult, MessageIdentity, ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub use image::GenerateImageTool;

/// Metadata advertised to the model for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// The turn a tool call belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    /// Identity of the assistant message being produced. Still ephemeral
    /// while tools run.
    pub identity: MessageIdentity,
    pub session_id: Uuid,
}

/// A tool the relay can execute once its call is fully reassembled.
///
/// Returning `Ok` with an error [`ToolResult`] reports a problem back to the
/// model and lets the turn continue; returning `Err` fails the turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> GenrelayResult<ToolResult>;
}

/// Tools available to the relay, by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<_> = self
            .tools
            .values()
            .map(|t| t.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Run a call. An unknown tool name yields an error result, not an `Err`.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> GenrelayResult<ToolResult> {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, ctx).await,
            None => {
                warn!(tool = %call.name, index = call.index, "Model called an unknown tool");
                Ok(ToolResult::error(call, format!("Unknown tool: {}", call.name)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
