//! Error Handling
//!
//! Unified error types for the application. Extends the core error set with
//! variants that require heavier dependencies (storage, git, model layer).
//! Uses thiserror for ergonomic error definitions.

use plandex_core::stream::{ApiError, ApiErrorType};
use plandex_core::CoreError;
use plandex_llm::LlmError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Core errors (user input, token limit, parse, not found, ...)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Lock table errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Lock contention exceeded the retry budget
    #[error("plan is currently being updated by another user")]
    RepoLockContention,

    /// Git command failures
    #[error("Git error: {0}")]
    Git(String),

    /// Model layer errors, surfaced after retries exhaust
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    /// A file build exhausted its attempts
    #[error("Build failed for {path}: {msg}")]
    BuildFailure { path: String, msg: String },

    /// Panic captured at a task boundary
    #[error("Panic: {0}")]
    Panic(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a git error
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Create a build failure error
    pub fn build_failure(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BuildFailure {
            path: path.into(),
            msg: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a user input error
    pub fn user_input(msg: impl Into<String>) -> Self {
        Self::Core(CoreError::user_input(msg))
    }

    /// Whether this error was caused by cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, AppError::Core(CoreError::Canceled))
            | matches!(self, AppError::Llm(LlmError::Canceled))
    }

    /// Convert to the wire-level error sent to stream subscribers.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            AppError::Core(CoreError::UserInput(msg)) => {
                ApiError::new(400, ApiErrorType::UserInput, msg.clone())
            }
            AppError::Core(CoreError::TokenLimit(msg)) => ApiError::token_limit(msg.clone()),
            AppError::RepoLockContention => ApiError::repo_lock(self.to_string()),
            AppError::Llm(err) => ApiError::model_stream(err.to_string()),
            AppError::BuildFailure { .. } => {
                ApiError::new(500, ApiErrorType::BuildFailure, self.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Convert AppError to a string
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::database("connection failed");
        assert_eq!(err.to_string(), "Database error: connection failed");
    }

    #[test]
    fn test_lock_contention_message() {
        let err = AppError::RepoLockContention;
        assert_eq!(
            err.to_string(),
            "plan is currently being updated by another user"
        );
        assert_eq!(err.to_api_error().status, 409);
    }

    #[test]
    fn test_build_failure_api_error() {
        let err = AppError::build_failure("main.rs", "validation exhausted");
        let api = err.to_api_error();
        assert_eq!(api.error_type, ApiErrorType::BuildFailure);
        assert!(api.msg.contains("main.rs"));
    }

    #[test]
    fn test_token_limit_maps_to_422() {
        let err = AppError::Core(CoreError::token_limit("over planner max"));
        assert_eq!(err.to_api_error().status, 422);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));
    }
}
