//! Configuration Limits
//!
//! Shared limits and timing constants. Values that govern cross-process
//! coordination (lock heartbeats, retry budgets) live here so the storage and
//! queue layers agree on them.

use std::time::Duration;

// ── Context limits ─────────────────────────────────────────────────────

/// Maximum number of contexts attached to a plan.
pub const MAX_CONTEXT_COUNT: usize = 200;

/// Maximum size of a single context body in bytes.
pub const MAX_CONTEXT_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum combined size of all context bodies on a plan in bytes.
pub const MAX_TOTAL_CONTEXT_SIZE: usize = 200 * 1024 * 1024;

/// Maximum number of paths in a single context map.
pub const MAX_CONTEXT_MAP_PATHS: usize = 20_000;

/// Maximum size of a single file fed to the context mapper.
pub const MAX_CONTEXT_MAP_SINGLE_INPUT_SIZE: usize = 1024 * 1024;

// ── Tell pipeline ──────────────────────────────────────────────────────

/// Hard ceiling on auto-continue iterations for a single tell.
pub const MAX_AUTO_CONTINUE_ITERATIONS: usize = 100;

/// Retries for transient planner stream errors.
pub const MAX_STREAM_ERROR_RETRIES: usize = 3;

// ── Build pipeline ─────────────────────────────────────────────────────

/// Validate/correct loop attempts before falling back to whole-file.
pub const MAX_VALIDATION_FIX_ATTEMPTS: usize = 4;

/// Retries for transient model errors during the structured build phase.
pub const MAX_BUILD_ERROR_RETRIES: usize = 3;

/// Retries for transient model errors during the whole-file fallback.
pub const MAX_WHOLE_FILE_RETRIES: usize = 1;

/// Retries for transient build stream errors.
pub const MAX_BUILD_STREAM_ERROR_RETRIES: usize = 3;

// ── Repo locks ─────────────────────────────────────────────────────────

/// Interval between heartbeat updates while a lock is held.
pub const LOCK_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(700);

/// A lock whose heartbeat is older than this is expired and may be reaped.
pub const LOCK_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(4);

/// Delay between lock acquisition retries.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retries before lock acquisition fails: ceil(10s / 500ms).
pub const LOCK_RETRY_LIMIT: usize = 20;

/// Consecutive heartbeat failures before the holder's operation is canceled.
pub const LOCK_HEARTBEAT_MAX_FAILURES: usize = 5;

// ── Client interaction timeouts ────────────────────────────────────────

/// How long to wait for a client's missing-file choice.
pub const MISSING_FILE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long to wait for a client to finish auto-loading context.
pub const AUTO_LOAD_CONTEXT_TIMEOUT: Duration = Duration::from_secs(30);
