use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible API.
    Groq,
    /// A local server such as Ollama or vLLM; set `api_base_url`.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: LlmProvider,
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
                LlmProvider::Groq => "https://api.groq.com/openai",
                LlmProvider::Local => "http://localhost:11434",
            }
        }
    }
}

/// Settings for [`crate::StreamRelay`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Capacity of the per-turn downstream event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. When the user asks for a picture, call the \
     generate_image tool with a short, concrete prompt."
        .to_string()
}

fn default_event_buffer() -> usize {
    128
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_defaults_from_toml() {
        let config: ModelConfig = toml::from_str(
            r#"
            provider = "openrouter"
            model_id = "openai/gpt-4o-mini"
            api_key = "sk-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider, LlmProvider::OpenRouter);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.base_url(), "https://openrouter.ai/api");
    }

    #[test]
    fn test_base_url_override() {
        let config = ModelConfig {
            provider: LlmProvider::OpenAi,
            model_id: "gpt-4o".into(),
            api_key: String::new(),
            api_base_url: Some("http://127.0.0.1:9000".into()),
            temperature: 0.0,
            max_tokens: 16,
        };
        assert_eq!(config.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_relay_config_default_buffer() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.event_buffer, 128);
        assert!(config.system_prompt.contains("generate_image"));
    }
}
