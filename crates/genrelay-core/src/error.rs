use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`GenrelayError`].
pub type GenrelayResult<T> = Result<T, GenrelayError>;

/// Failure of a single generation episode.
///
/// Every waiter attached to an episode receives its own copy, so this type is
/// `Clone` and carries only owned strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The artifact generator reported a failure.
    #[error("generation failed: {0}")]
    Failed(String),

    /// The artifact generator did not answer within the episode timeout.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// The episode ended without producing a result (task aborted or panicked).
    #[error("generation episode abandoned")]
    Abandoned,
}

/// Top-level error type for genrelay.
#[derive(Error, Debug)]
pub enum GenrelayError {
    /// Transport or provider failure while a stream was open.
    #[error("Upstream stream error: {0}")]
    Upstream(String),

    /// The accumulated arguments of a tool call are not valid JSON.
    #[error("Tool argument parse error (call {index}): {message}")]
    ToolArgumentParse { index: u32, message: String },

    /// The artifact generator failed for this episode.
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// An ephemeral identity was never promoted within the reconciler window.
    #[error("Association timeout for prompt '{prompt}'")]
    AssociationTimeout { prompt: String },

    /// Misuse of a message identity (double promotion, ephemeral used as key).
    #[error("Identity error: {0}")]
    Identity(String),

    /// A tool could not be resolved or executed.
    #[error("Tool error: {0}")]
    Tool(String),

    /// The durable message store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
