use genrelay_agent::{ModelConfig, RelayConfig};
use genrelay_generation::{CoordinatorConfig, ImageConfig};
use genrelay_session::ReconcilerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of `genrelay.toml`.
#[derive(Debug, Deserialize)]
pub struct GenrelayConfig {
    pub model: ModelConfig,
    pub image: ImageConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl GenrelayConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.coordinator.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let mut config = Self::parse(&raw)?;
        config.fill_keys_from_env();
        Ok(config)
    }

    /// Empty API keys fall back to `GENRELAY_MODEL_API_KEY` /
    /// `GENRELAY_IMAGE_API_KEY`, then `OPENAI_API_KEY`.
    fn fill_keys_from_env(&mut self) {
        let shared = std::env::var("OPENAI_API_KEY").ok();
        if self.model.api_key.is_empty() {
            if let Some(key) = std::env::var("GENRELAY_MODEL_API_KEY").ok().or(shared.clone()) {
                self.model.api_key = key;
            }
        }
        if self.image.api_key.is_empty() {
            if let Some(key) = std::env::var("GENRELAY_IMAGE_API_KEY").ok().or(shared) {
                self.image.api_key = key;
            }
        }
    }
}
