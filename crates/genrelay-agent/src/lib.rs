//! Streaming turn relay for genrelay.
//!
//! Consumes a provider's chunked response, forwards text as it arrives,
//! reassembles tool calls split across chunks and runs them once the
//! response is complete.

pub mod accumulator;
pub mod backends;
pub mod config;
pub mod relay;
pub mod stream;
pub mod tools;

pub use accumulator::ToolCallAccumulator;
pub use backends::{LlmBackend, OpenAiBackend, ProviderStream};
pub use config::{LlmProvider, ModelConfig, RelayConfig};
pub use relay::{RelayHandle, RelayOutcome, StreamRelay, Turn};
pub use stream::{ChunkEvent, FinishReason, RelayEvent, ToolCallFragment};
pub use tools::{GenerateImageTool, Tool, ToolContext, ToolDescriptor, ToolRegistry};
