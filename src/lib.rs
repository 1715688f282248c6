//! Plandex Server
//!
//! The plan execution core of an AI coding assistant server: drives active
//! plans through streaming model conversations, runs concurrent per-file
//! build pipelines, serializes access to each plan's git-backed working
//! directory, and persists every artifact as committed snapshots.
//!
//! ## Layout
//!
//! - `models` - the data model (plans, contexts, conversation, results)
//! - `storage` - plan file store, git wrapper, distributed lock table
//! - `services` - the pipelines: queue, active registry, reply parsing,
//!   build, tell, context formatting, exec-status
//! - `state` - the injected server environment
//! - `testing` - scripted model provider for tests

pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod testing;
pub mod utils;

pub use state::ServerState;
pub use utils::error::{AppError, AppResult};
