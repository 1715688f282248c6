//! Plandex LLM
//!
//! Model provider abstraction for the plan execution core. The core is
//! polymorphic over `{create_chat_completion_stream, num_tokens}`; this crate
//! defines that trait plus one OpenAI-compatible implementation over SSE.
//!
//! ## Module Organization
//!
//! - `types` - Request/response/usage types and `LlmError`
//! - `provider` - The `ModelProvider` trait and `CompletionStream`
//! - `http_client` - reqwest client factory
//! - `openai` - OpenAI-compatible SSE provider
//! - `retry` - Backoff wrapper for transient stream failures
//! - `tokens` - Fast token estimation

pub mod http_client;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod tokens;
pub mod types;

pub use openai::OpenAiCompatProvider;
pub use provider::{CompletionStream, ModelProvider};
pub use retry::create_chat_completion_stream_with_retries;
pub use tokens::estimate_tokens;
pub use types::{
    ChatCompletionRequest, ChatMessage, FinishReason, LlmError, LlmResult, Role, StreamChunk,
    Usage,
};
