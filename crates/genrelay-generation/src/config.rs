use genrelay_core::{GenrelayError, GenrelayResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for [`crate::GenerationCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum number of Ready entries kept in the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Upper bound on one external generation call.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Buffer of the subscriber broadcast channel; slow subscribers lag past it.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_cache_capacity() -> usize {
    256
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            generation_timeout_secs: default_generation_timeout_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl CoordinatorConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn validate(&self) -> GenrelayResult<()> {
        if self.cache_capacity == 0 {
            return Err(GenrelayError::Config(
                "coordinator.cache_capacity must be at least 1".into(),
            ));
        }
        if self.generation_timeout_secs == 0 {
            return Err(GenrelayError::Config(
                "coordinator.generation_timeout_secs must be at least 1".into(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(GenrelayError::Config(
                "coordinator.subscriber_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the OpenAI-compatible image generation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base_url: Option<String>,
    #[serde(default = "default_size")]
    pub size: String,
}

fn default_size() -> String {
    "1024x1024".to_string()
}

impl ImageConfig {
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
    }
}
