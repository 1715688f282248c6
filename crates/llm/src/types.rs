//! LLM Request and Response Types
//!
//! Provider-agnostic chat completion types. Providers translate these to and
//! from their own wire formats.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the model layer.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// Transport failure opening or reading a stream
    #[error("Stream error: {0}")]
    Stream(String),

    /// No chunk arrived within the provider's inactivity window
    #[error("Stream timeout: no chunk received within {0} seconds")]
    ChunkTimeout(u64),

    /// The response carried no choices
    #[error("Stream error: no choices in response")]
    NoChoices,

    /// Malformed JSON or XML in a streamed payload
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Authentication / authorization failure
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider returned a retryable HTTP status
    #[error("Provider error ({status}): {message}")]
    Http { status: u16, message: String },

    /// The request was canceled
    #[error("Request canceled")]
    Canceled,
}

/// Result type alias for model layer errors
pub type LlmResult<T> = Result<T, LlmError>;

impl LlmError {
    /// Whether retrying the request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Stream(_)
            | LlmError::ChunkTimeout(_)
            | LlmError::NoChoices
            | LlmError::Malformed(_) => true,
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            LlmError::Auth(_) | LlmError::Canceled => false,
        }
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation turn sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A streaming chat completion request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences; the planner passes the finish control token here
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
    /// Predicted output hint for providers that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
    /// Request usage reporting in the final stream chunk
    #[serde(skip_serializing)]
    pub include_usage: bool,
}

/// Why the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// Token usage reported with the final chunk when `include_usage` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub cached_prompt_tokens: u32,
}

/// One delta from a streaming completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Content delta, empty on control chunks
    pub content: String,
    /// Set on the terminal choice
    pub finish_reason: Option<FinishReason>,
    /// Set on the usage chunk (typically after the terminal choice)
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some() || self.usage.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LlmError::Stream("reset".into()).is_retryable());
        assert!(LlmError::NoChoices.is_retryable());
        assert!(LlmError::Http {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!LlmError::Auth("bad key".into()).is_retryable());
        assert!(!LlmError::Canceled.is_retryable());
        assert!(!LlmError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, Role::User);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_stream_chunk_terminal() {
        assert!(!StreamChunk::content("a").is_terminal());
        assert!(StreamChunk {
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }
        .is_terminal());
    }
}
