use crate::config::ImageConfig;
use crate::key::PromptDescriptor;
use async_trait::async_trait;
use genrelay_core::{ArtifactRef, GenerationError};
use tracing::debug;

/// Backend that turns a prompt into an artifact.
///
/// Calls are expensive and safe to retry. Implementations do no
/// deduplication of their own; that is the coordinator's job.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, descriptor: &PromptDescriptor) -> Result<ArtifactRef, GenerationError>;
}

/// OpenAI-compatible `/v1/images/generations` backend.
pub struct HttpImageGenerator {
    config: ImageConfig,
    http: reqwest::Client,
}

impl HttpImageGenerator {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_prompt(descriptor: &PromptDescriptor) -> String {
        match descriptor.style.as_deref() {
            Some(style) => format!("{}\n\nStyle: {}", descriptor.prompt, style),
            None => descriptor.prompt.clone(),
        }
    }
}

#[async_trait]
impl ArtifactGenerator for HttpImageGenerator {
    async fn generate(&self, descriptor: &PromptDescriptor) -> Result<ArtifactRef, GenerationError> {
        let url = format!("{}/v1/images/generations", self.config.base_url());
        let body = serde_json::json!({
            "model": self.config.model_id,
            "prompt": Self::build_prompt(descriptor),
            "n": 1,
            "size": self.config.size,
        });

        debug!(model = %self.config.model_id, "Requesting image generation");

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Failed(format!("request failed: {e}")))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::Failed(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            return Err(GenerationError::Failed(format!(
                "Image API error {status}: {resp_body}"
            )));
        }

        parse_image_response(&resp_body)
    }
}

/// Extract the first image from an images API response.
///
/// Hosted URLs are preferred; inline base64 payloads become `data:` URIs.
pub fn parse_image_response(body: &serde_json::Value) -> Result<ArtifactRef, GenerationError> {
    let first = &body["data"][0];
    if let Some(url) = first["url"].as_str() {
        return Ok(ArtifactRef::new(url));
    }
    if let Some(b64) = first["b64_json"].as_str() {
        return Ok(ArtifactRef::new(format!("data:image/png;base64,{b64}")));
    }
    Err(GenerationError::Failed(
        "Image API response contained no image".to_string(),
    ))
}
