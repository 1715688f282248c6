//! Active Plans
//!
//! In-memory coordination of live streams: the per-stream `ActivePlan` and
//! the process-wide registry keyed by `(planId, branch)`.

pub mod plan;
pub mod registry;

pub use plan::{ActiveBuild, ActivePlan, MissingFileChoice};
pub use registry::ActiveRegistry;
