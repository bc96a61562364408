use super::{Tool, ToolContext, ToolDescriptor};
use async_trait::async_trait;
use genrelay_core::{GenrelayResult, ToolCall, ToolResult};
use genrelay_generation::{GenerationCoordinator, PromptDescriptor, ResolutionSource};
use genrelay_session::PersistenceReconciler;
use std::sync::Arc;
use tracing::info;

/// Generates an image for a prompt through the shared coordinator.
///
/// Concurrent calls for the same prompt and style, from any turn, share one
/// upstream generation. The artifact is handed to the reconciler against the
/// turn's message identity so it gets associated once that message is stored.
pub struct GenerateImageTool {
    descriptor: ToolDescriptor,
    coordinator: GenerationCoordinator,
    reconciler: Option<Arc<PersistenceReconciler>>,
}

impl GenerateImageTool {
    pub const NAME: &'static str = "generate_image";

    pub fn new(coordinator: GenerationCoordinator) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: Self::NAME.to_string(),
                description: "Generate an image from a text prompt. Returns a reference to the \
                              generated image."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "prompt": {
                            "type": "string",
                            "description": "What the image should show"
                        },
                        "style": {
                            "type": "string",
                            "description": "Optional visual style, e.g. 'watercolor'"
                        }
                    },
                    "required": ["prompt"]
                }),
            },
            coordinator,
            reconciler: None,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<PersistenceReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> GenrelayResult<ToolResult> {
        let prompt = match call.arguments["prompt"].as_str() {
            Some(p) if !p.trim().is_empty() => p,
            _ => {
                return Ok(ToolResult::error(
                    call,
                    "'prompt' must be a non-empty string",
                ))
            }
        };

        let mut descriptor = PromptDescriptor::new(prompt);
        match &call.arguments["style"] {
            serde_json::Value::Null => {}
            serde_json::Value::String(style) => descriptor = descriptor.with_style(style.clone()),
            _ => return Ok(ToolResult::error(call, "'style' must be a string")),
        }
        let key = descriptor.key();

        if let Some(reconciler) = &self.reconciler {
            reconciler.expect_artifact(ctx.identity, &key);
        }

        let resolution = self.coordinator.resolve(descriptor).await?;

        if let Some(reconciler) = &self.reconciler {
            reconciler
                .on_artifact_ready(ctx.identity, &key, resolution.artifact_ref.clone())
                .await?;
        }

        let cached = resolution.source == ResolutionSource::Cached;
        info!(
            key = %key,
            owner = %ctx.identity,
            source = ?resolution.source,
            "Image ready for tool call"
        );

        let mut content = serde_json::json!({
            "prompt": key.prompt(),
            "artifact_ref": resolution.artifact_ref.as_str(),
            "cached": cached,
        });
        if let Some(style) = key.style() {
            content["style"] = serde_json::json!(style);
        }

        Ok(ToolResult::success(call, content))
    }
}
