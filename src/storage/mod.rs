//! Storage
//!
//! Everything that touches disk or the lock table: the per-plan file layout,
//! the git working copy wrapper, and the distributed `repo_locks` table.

pub mod db;
pub mod fs;
pub mod git;
pub mod locks;

pub use db::{Database, DbPool};
pub use fs::PlanFs;
pub use git::GitRepo;
pub use locks::{LockScope, LockStore, RepoLock};
