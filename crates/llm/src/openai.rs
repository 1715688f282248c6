//! OpenAI-Compatible Provider
//!
//! Streams chat completions from any OpenAI-compatible endpoint over SSE.
//! Lines are buffered until a full `data: {...}` event is available, parsed
//! into deltas, and forwarded as unified `StreamChunk`s.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::http_client::build_http_client;
use crate::provider::{CompletionStream, ModelProvider};
use crate::types::{
    ChatCompletionRequest, FinishReason, LlmError, LlmResult, StreamChunk, Usage,
};

/// Internal event types from the OpenAI-compatible SSE format
#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    usage: Option<SseUsage>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<SsePromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct SsePromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

/// Provider for OpenAI-compatible chat completion endpoints.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    /// Whether the endpoint honors the `prediction` request field
    pub predicted_output_enabled: bool,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            predicted_output_enabled: false,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, req: &ChatCompletionRequest) -> serde_json::Value {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
            "stream": true,
        });

        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = json!(top_p);
        }
        if !req.stop.is_empty() {
            body["stop"] = json!(req.stop);
        }
        if req.include_usage {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if self.predicted_output_enabled {
            if let Some(prediction) = &req.prediction {
                body["prediction"] = json!({ "type": "content", "content": prediction });
            }
        }

        body
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn create_chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream> {
        let body = self.build_body(&req);

        let request = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body);

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| LlmError::Stream(e.to_string()))?,
            _ = cancel.cancelled() => return Err(LlmError::Canceled),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::Auth(message),
                code => LlmError::Http {
                    status: code,
                    message,
                },
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let model = req.model.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut line_buffer = String::new();

            loop {
                let next = tokio::select! {
                    chunk = byte_stream.next() => chunk,
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(LlmError::Canceled)).await;
                        return;
                    }
                };

                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                    None => return,
                };

                line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline_idx) = line_buffer.find('\n') {
                    let line = line_buffer[..newline_idx].trim_end_matches('\r').to_string();
                    line_buffer.drain(..=newline_idx);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }

                    match parse_sse_event(data) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(model, error = %e, "malformed SSE event");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(CompletionStream::new(rx))
    }
}

fn parse_sse_event(data: &str) -> LlmResult<Vec<StreamChunk>> {
    let event: SseEvent =
        serde_json::from_str(data).map_err(|e| LlmError::Malformed(e.to_string()))?;

    let mut chunks = Vec::new();

    for choice in &event.choices {
        let mut chunk = StreamChunk::default();
        if let Some(delta) = &choice.delta {
            if let Some(content) = &delta.content {
                chunk.content.push_str(content);
            } else if let Some(reasoning) = &delta.reasoning_content {
                chunk.content.push_str(reasoning);
            }
        }
        chunk.finish_reason = choice.finish_reason.as_deref().map(parse_finish_reason);
        if !chunk.content.is_empty() || chunk.finish_reason.is_some() {
            chunks.push(chunk);
        }
    }

    if let Some(usage) = event.usage {
        chunks.push(StreamChunk {
            usage: Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                cached_prompt_tokens: usage
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
            }),
            ..Default::default()
        });
    }

    Ok(chunks)
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Error,
    }
}
