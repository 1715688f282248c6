//! Server-to-Client Stream Protocol
//!
//! Every message a plan stream can emit to its subscribers. The active plan
//! coalesces bursts of reply chunks into `Multi` batches; control messages
//! (missing file, load context, finished, error) bypass buffering.

use serde::{Deserialize, Serialize};

/// Per-file build progress reported alongside the reply stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub path: String,
    pub num_tokens: usize,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

/// Wire-level error kind, mirrored by the application error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    UserInput,
    TokenLimit,
    ModelStream,
    BuildFailure,
    RepoLock,
    ContinueNoMessages,
    Other,
}

/// Structured error sent to subscribers before the stream closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: ApiErrorType,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: u16, error_type: ApiErrorType, msg: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(500, ApiErrorType::Other, msg)
    }

    pub fn model_stream(msg: impl Into<String>) -> Self {
        Self::new(502, ApiErrorType::ModelStream, msg)
    }

    pub fn token_limit(msg: impl Into<String>) -> Self {
        Self::new(422, ApiErrorType::TokenLimit, msg)
    }

    pub fn repo_lock(msg: impl Into<String>) -> Self {
        Self::new(409, ApiErrorType::RepoLock, msg)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.msg, self.status)
    }
}

impl std::error::Error for ApiError {}

/// A message on the plan's subscriber stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamMessage {
    /// A chunk of the assistant's reply, already cleaned of control tokens
    Reply { chunk: String },

    /// Per-file build progress
    BuildInfo { info: BuildInfo },

    /// The reply finished streaming; a description is being generated
    Describing,

    /// All reply iterations are done; builds may still be running
    RepliesFinished,

    /// The model opened a file block for a project path that isn't in context;
    /// the stream is paused until the client responds
    PromptMissingFile { path: String, auto_context: bool },

    /// The reply asked for project files to be loaded into context
    LoadContext { paths: Vec<String> },

    /// Terminal message: replies and builds have both drained
    Finished,

    /// Terminal message: the stream failed
    Error { error: ApiError },

    /// Coalesced burst of buffered messages
    Multi { messages: Vec<StreamMessage> },
}

impl StreamMessage {
    /// Control messages bypass the stream buffer and force a flush first.
    pub fn skips_buffer(&self) -> bool {
        matches!(
            self,
            StreamMessage::PromptMissingFile { .. }
                | StreamMessage::LoadContext { .. }
                | StreamMessage::Finished
                | StreamMessage::Error { .. }
        )
    }
}
