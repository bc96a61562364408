//! Single-flight generation coordinator for genrelay.
//!
//! [`GenerationCoordinator`] collapses concurrent requests for the same
//! [`GenerationKey`] into one call to an [`ArtifactGenerator`], keeps
//! successful results in a bounded [`ReadyCache`], and publishes every
//! completed episode to subscribers.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod generator;
pub mod key;

pub use cache::ReadyCache;
pub use config::{CoordinatorConfig, ImageConfig};
pub use coordinator::{
    CoordinatorStats, GenerationCoordinator, GenerationEvent, GenerationRecord, GenerationState,
    Resolution, ResolutionSource,
};
pub use generator::{ArtifactGenerator, HttpImageGenerator};
pub use key::{GenerationKey, PromptDescriptor};
