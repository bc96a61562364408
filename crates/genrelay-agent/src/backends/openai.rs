use super::{LlmBackend, ProviderStream};
use crate::config::{LlmProvider, ModelConfig};
use crate::stream::{ChunkEvent, FinishReason, ToolCallFragment};
use crate::tools::ToolDescriptor;
use async_trait::async_trait;
use futures_util::StreamExt;
use genrelay_core::{GenrelayError, GenrelayResult, Message, Role};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// OpenAI-compatible streaming chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in messages {
            let role = match m.role {
                Role::System => continue,
                Role::User | Role::Tool => "user",
                Role::Assistant => "assistant",
            };
            api_messages.push(serde_json::json!({
                "role": role,
                "content": m.content
            }));
        }

        api_messages
    }

    fn build_tools(&self, tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        let request = if self.config.api_key.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.config.api_key))
        };

        // OpenRouter requires extra headers
        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            request.header("X-Title", "genrelay")
        } else {
            request
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn chat_stream(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> GenrelayResult<ProviderStream> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(system_prompt, messages),
            "stream": true,
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(self.build_tools(tools));
        }

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenrelayError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(GenrelayError::Upstream(format!(
                "OpenAI API error {}: {}",
                status, error_body
            )));
        }

        let (tx, rx) = mpsc::channel::<GenrelayResult<ChunkEvent>>(256);
        let mut byte_stream = resp.bytes_stream();

        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GenrelayError::Upstream(format!(
                                "Stream read error: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };

                for event in decoder.push(&chunk) {
                    let finished = matches!(event, Ok(ChunkEvent::Finished(_)) | Err(_));
                    if tx.send(event).await.is_err() {
                        debug!("Stream consumer went away, stopping reader");
                        return;
                    }
                    if finished {
                        return;
                    }
                }
            }
        });

        Ok(ProviderStream::new(rx, task))
    }
}

/// Incremental decoder for an OpenAI-style `text/event-stream` body.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<GenrelayResult<ChunkEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    continue;
                }
                match parse_stream_data(data) {
                    Ok(parsed) => events.extend(parsed.into_iter().map(Ok)),
                    Err(e) => events.push(Err(e)),
                }
            }
        }

        events
    }
}

/// Decode one `data:` payload of a streaming chat completion.
///
/// A payload can carry a content delta, tool call fragments and a finish
/// reason at once; they are returned in that order.
pub fn parse_stream_data(data: &str) -> GenrelayResult<Vec<ChunkEvent>> {
    let event: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| GenrelayError::Upstream(format!("Malformed stream payload: {e}")))?;

    if let Some(error) = event.get("error") {
        let message = error["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Ok(vec![ChunkEvent::Finished(FinishReason::Error(message))]);
    }

    let mut out = Vec::new();
    let Some(choice) = event["choices"].get(0) else {
        return Ok(out);
    };
    let delta = &choice["delta"];

    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            out.push(ChunkEvent::ContentDelta(content.to_string()));
        }
    }

    if let Some(tc_array) = delta["tool_calls"].as_array() {
        let mut fragments = Vec::with_capacity(tc_array.len());
        for tc in tc_array {
            let Some(index) = tc["index"].as_u64() else {
                warn!(fragment = %tc, "Tool call fragment without index");
                return Err(GenrelayError::Upstream(
                    "tool call fragment without index".into(),
                ));
            };
            let index = u32::try_from(index).map_err(|_| {
                GenrelayError::Upstream(format!("tool call index {index} out of range"))
            })?;
            fragments.push(ToolCallFragment {
                index,
                name: tc["function"]["name"].as_str().map(str::to_string),
                arguments_chunk: tc["function"]["arguments"].as_str().map(str::to_string),
            });
        }
        if !fragments.is_empty() {
            out.push(ChunkEvent::ToolCallFragments(fragments));
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        out.push(ChunkEvent::Finished(FinishReason::from_provider(reason)));
    }

    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_delta() {
        let events =
            parse_stream_data(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(events, vec![ChunkEvent::ContentDelta("Hel".into())]);
    }

    #[test]
    fn test_parse_tool_fragment_and_finish_in_one_payload() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"generate_image","arguments":"{\"promp"}}]},"finish_reason":"tool_calls"}]}"#;
        let events = parse_stream_data(data).unwrap();
        assert_eq!(
            events,
            vec![
                ChunkEvent::ToolCallFragments(vec![ToolCallFragment::new(0)
                    .with_name("generate_image")
                    .with_arguments("{\"promp")]),
                ChunkEvent::Finished(FinishReason::ToolCalls),
            ]
        );
    }

    #[test]
    fn test_parse_provider_error_payload() {
        let events = parse_stream_data(r#"{"error":{"message":"overloaded"}}"#).unwrap();
        assert_eq!(
            events,
            vec![ChunkEvent::Finished(FinishReason::Error("overloaded".into()))]
        );
    }

    #[test]
    fn test_malformed_payload_is_upstream_error() {
        assert!(matches!(
            parse_stream_data("{not json"),
            Err(GenrelayError::Upstream(_))
        ));
    }

    #[test]
    fn test_oversized_tool_index_is_upstream_error() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":4294967296,"function":{"name":"x"}}]}}]}"#;
        let err = parse_stream_data(data).unwrap_err();
        assert!(matches!(err, GenrelayError::Upstream(m) if m.contains("out of range")));
    }

    #[test]
    fn test_decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"caf");
        assert!(first.is_empty());

        // U+00E9 split between two network chunks.
        let mut rest = vec![0xC3];
        let second = decoder.push(&rest);
        assert!(second.is_empty());
        rest = vec![0xA9];
        rest.extend_from_slice(b"\"}}]}\n\n: keep-alive\ndata: [DONE]\n");
        let events = decoder.push(&rest);

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &ChunkEvent::ContentDelta("caf\u{e9}".into())
        );
    }
}
