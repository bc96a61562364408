#![allow(clippy::unwrap_used, clippy::expect_used)]

use genrelay_core::GenerationError;
use genrelay_generation::{
    ArtifactGenerator, CoordinatorConfig, GenerationCoordinator, HttpImageGenerator, ImageConfig,
    PromptDescriptor,
};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn image_config(server: &MockServer) -> ImageConfig {
    ImageConfig {
        model_id: "gpt-image-1".to_string(),
        api_key: "sk-test".to_string(),
        api_base_url: Some(server.uri()),
        size: "512x512".to_string(),
    }
}

#[tokio::test]
async fn test_generates_url_artifact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-image-1",
            "prompt": "a cat",
            "size": "512x512",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": "https://img.example/cat.png"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let generator = HttpImageGenerator::new(image_config(&server));
    let artifact = generator
        .generate(&PromptDescriptor::new("a cat"))
        .await
        .unwrap();
    assert_eq!(artifact.as_str(), "https://img.example/cat.png");
}

#[tokio::test]
async fn test_api_error_is_generation_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "error": {"message": "overloaded"}
        })))
        .mount(&server)
        .await;

    let generator = HttpImageGenerator::new(image_config(&server));
    let err = generator
        .generate(&PromptDescriptor::new("a cat"))
        .await
        .unwrap_err();
    match err {
        GenerationError::Failed(msg) => assert!(msg.contains("500"), "got: {msg}"),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_coordinator_deduplicates_http_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"b64_json": "QUJD"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let coord = GenerationCoordinator::new(
        Arc::new(HttpImageGenerator::new(image_config(&server))),
        &CoordinatorConfig::default(),
    );

    let first = coord.request(PromptDescriptor::new("a cat")).await.unwrap();
    let second = coord.request(PromptDescriptor::new(" a  cat ")).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.as_str(), "data:image/png;base64,QUJD");
}
