//! Model Provider Trait
//!
//! The seam between the execution core and model vendors. The core only ever
//! needs a streaming chat completion and a token count; everything else
//! (endpoints, auth, wire formats) is a provider concern.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tokens::estimate_tokens;
use crate::types::{ChatCompletionRequest, LlmError, LlmResult, StreamChunk};

/// A live streaming completion. Chunks arrive in model order; the channel
/// closes after the terminal chunk or an error.
pub struct CompletionStream {
    rx: mpsc::Receiver<LlmResult<StreamChunk>>,
}

impl CompletionStream {
    pub fn new(rx: mpsc::Receiver<LlmResult<StreamChunk>>) -> Self {
        Self { rx }
    }

    /// Receive the next chunk. `None` means the stream closed cleanly.
    pub async fn recv(&mut self) -> Option<LlmResult<StreamChunk>> {
        self.rx.recv().await
    }

    /// Drain the stream into a single response string, discarding usage.
    pub async fn collect_content(mut self) -> LlmResult<String> {
        let mut content = String::new();
        while let Some(chunk) = self.recv().await {
            content.push_str(&chunk?.content);
        }
        if content.is_empty() {
            return Err(LlmError::NoChoices);
        }
        Ok(content)
    }
}

/// Trait all model providers implement.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logging and identification.
    fn name(&self) -> &'static str;

    /// Open a streaming chat completion.
    ///
    /// Cancelling `cancel` aborts the underlying request; the stream then
    /// yields `LlmError::Canceled` or closes.
    async fn create_chat_completion_stream(
        &self,
        req: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream>;

    /// Count (or estimate) tokens for budgeting. The default is the shared
    /// fast estimate; providers with a real tokenizer override this.
    fn num_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}
