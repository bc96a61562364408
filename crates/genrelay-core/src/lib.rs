//! Core types and error definitions for genrelay.
//!
//! This crate holds the vocabulary shared by every other genrelay crate:
//! errors, message identities, stored messages, tool calls and artifact
//! associations.
//!
//! # Main types
//!
//! - [`GenrelayError`]: Unified error enum for all genrelay subsystems.
//! - [`GenrelayResult`]: Convenience alias for `Result<T, GenrelayError>`.
//! - [`GenerationError`]: Cloneable failure of one generation episode.
//! - [`MessageIdentity`]: Ephemeral placeholder or permanent store id.
//! - [`Message`]: A single conversational message.
//! - [`ToolCall`]: A fully reassembled tool invocation.
//! - [`ArtifactAssociation`]: Durable link between a message and an artifact.

/// Artifact references and their association with stored messages.
pub mod association;
/// Error types.
pub mod error;
/// Ephemeral and permanent message identities.
pub mod identity;
/// Conversation messages.
pub mod message;
/// Tool calls and tool results.
pub mod tool;

pub use association::{ArtifactAssociation, ArtifactRef};
pub use error::{GenerationError, GenrelayError, GenrelayResult};
pub use identity::{EphemeralToken, MessageIdentity, StoreId};
pub use message::{Message, Role};
pub use tool::{ToolCall, ToolResult};
