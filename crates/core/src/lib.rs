//! Plandex Server Core
//!
//! Foundational types for the plan execution core. This crate has zero
//! dependencies on application-level code (storage, LLM providers, git, etc.).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `ops` - Parsed file operations (`Operation`, `OperationType`)
//! - `stream` - Server-to-client stream protocol (`StreamMessage`, `ApiError`)
//! - `tokens` - Model control token constants and helpers
//! - `limits` - Configuration limits shared across the workspace
//!
//! ## Design Principles
//!
//! 1. **Zero external dependencies beyond serde/thiserror** - keeps build times minimal
//! 2. **Closed sum types at the language boundary** - operations, context types,
//!    and stream messages are enums, never string tags
//! 3. **Unidirectional dependency** - this crate depends on nothing else in the workspace

pub mod error;
pub mod limits;
pub mod ops;
pub mod stream;
pub mod tokens;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── File Operations ────────────────────────────────────────────────────
pub use ops::{Operation, OperationType};

// ── Stream Protocol ────────────────────────────────────────────────────
pub use stream::{ApiError, ApiErrorType, BuildInfo, StreamMessage};

// ── Control Tokens ─────────────────────────────────────────────────────
pub use tokens::{
    get_all_xml_content, get_xml_content, BLOCK_CLOSE_TAG, BLOCK_OPEN_PREFIX, CORRECT_TAG,
    END_FILE_OPS_TAG, FINISH_STOP_SEQUENCE, INCORRECT_TAG,
};
