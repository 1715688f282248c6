//! Test Support
//!
//! In-process scripted model provider used by pipeline tests: each request
//! pops the next scripted response and streams it back in small chunks.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plandex_llm::{
    ChatCompletionRequest, CompletionStream, FinishReason, LlmError, LlmResult, ModelProvider,
    StreamChunk, Usage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Provider that replays scripted responses in request order. Responses can
/// also be routed by model name so concurrent calls from different roles
/// (describer, summarizer, exec-status) stay deterministic.
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    routed: Mutex<std::collections::HashMap<String, Vec<String>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
    pub chunk_size: usize,
}

impl ScriptedProvider {
    /// Responses are consumed front to back, one per request.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            routed: Mutex::new(std::collections::HashMap::new()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 8,
        }
    }

    /// Push another scripted response onto the back of the queue.
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(response.into());
    }

    /// Queue a response for requests whose model name matches exactly.
    /// Routed responses win over the sequential queue.
    pub fn route(&self, model: impl Into<String>, response: impl Into<String>) {
        self.routed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model.into())
            .or_default()
            .push(response.into());
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn num_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of requests seen for a given model name.
    pub fn num_requests_for(&self, model: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.model == model)
            .count()
    }

    fn next_response(&self, model: &str) -> Option<String> {
        {
            let mut routed = self.routed.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(queue) = routed.get_mut(model) {
                if !queue.is_empty() {
                    return Some(queue.remove(0));
                }
            }
        }
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if responses.is_empty() {
            None
        } else {
            Some(responses.remove(0))
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream> {
        let stop_sequences = req.stop.clone();
        let model = req.model.clone();
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req);

        let Some(mut response) = self.next_response(&model) else {
            return Err(LlmError::Stream("no scripted response left".into()));
        };

        // honor stop sequences the way a real provider would
        for stop in &stop_sequences {
            if let Some(idx) = response.find(stop.as_str()) {
                response.truncate(idx);
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let chunk_size = self.chunk_size.max(1);
        tokio::spawn(async move {
            let chars: Vec<char> = response.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(LlmError::Canceled)).await;
                    return;
                }
                let content: String = chunk.iter().collect();
                if tx.send(Ok(StreamChunk::content(content))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    finish_reason: Some(FinishReason::Stop),
                    ..Default::default()
                }))
                .await;
            let _ = tx
                .send(Ok(StreamChunk {
                    usage: Some(Usage {
                        prompt_tokens: 100,
                        completion_tokens: chars.len() as u32,
                        cached_prompt_tokens: 0,
                    }),
                    ..Default::default()
                }))
                .await;
        });

        Ok(CompletionStream::new(rx))
    }
}
