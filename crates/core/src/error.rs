//! Core Error Types
//!
//! Defines the foundational error types used across the workspace. These are
//! dependency-free (only thiserror + std) to keep the core crate lightweight.
//!
//! The main application crate extends these with additional error variants
//! (e.g., Database, RepoLock, Llm) that require heavier dependencies.

use thiserror::Error;

/// Core error type for the plan execution workspace.
///
/// This is the minimal error set that the core crate needs. The application
/// crate defines additional variants for storage, locking, model streams, etc.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed request or input exceeding configured limits
    #[error("Invalid input: {0}")]
    UserInput(String),

    /// Token budget exceeded even after summary substitution
    #[error("Token limit exceeded: {0}")]
    TokenLimit(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cancellation surfaced as an error at operation boundaries
    #[error("Operation canceled")]
    Canceled,

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a user input error
    pub fn user_input(msg: impl Into<String>) -> Self {
        Self::UserInput(msg.into())
    }

    /// Create a token limit error
    pub fn token_limit(msg: impl Into<String>) -> Self {
        Self::TokenLimit(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert CoreError to a string
impl From<CoreError> for String {
    fn from(err: CoreError) -> String {
        err.to_string()
    }
}
