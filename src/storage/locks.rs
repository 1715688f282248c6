//! Distributed Repo Locks
//!
//! The `repo_locks` table coordinates access to each plan's working copy
//! across server instances. Liveness is heartbeat-based: a holder updates
//! `last_heartbeat_at` every 700 ms, and any contender may reap rows whose
//! heartbeat is older than the timeout.

use chrono::{DateTime, Utc};
use plandex_core::limits::{
    LOCK_HEARTBEAT_INTERVAL, LOCK_HEARTBEAT_MAX_FAILURES, LOCK_HEARTBEAT_TIMEOUT,
    LOCK_RETRY_DELAY, LOCK_RETRY_LIMIT,
};
use rusqlite::params;
use tokio_util::sync::CancellationToken;

use super::db::Database;
use crate::utils::error::{AppError, AppResult};

/// Lock scope: concurrent same-branch readers, or one exclusive writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Read,
    Write,
}

impl LockScope {
    fn as_str(&self) -> &'static str {
        match self {
            LockScope::Read => "r",
            LockScope::Write => "w",
        }
    }

    fn from_str(s: &str) -> Self {
        if s == "w" {
            LockScope::Write
        } else {
            LockScope::Read
        }
    }
}

/// A row in the lock table.
#[derive(Debug, Clone)]
pub struct RepoLock {
    pub id: String,
    pub org_id: String,
    pub user_id: Option<String>,
    pub plan_id: String,
    pub plan_build_id: Option<String>,
    pub scope: LockScope,
    pub branch: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a lock acquisition.
#[derive(Debug, Clone)]
pub struct LockRepoParams {
    pub org_id: String,
    pub user_id: Option<String>,
    pub plan_id: String,
    pub branch: Option<String>,
    pub scope: LockScope,
    pub plan_build_id: Option<String>,
    pub reason: String,
}

/// Lock store over the shared database.
#[derive(Clone)]
pub struct LockStore {
    db: Database,
}

impl LockStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Acquire a lock, retrying on contention up to the retry budget.
    ///
    /// On success a heartbeat task is spawned that renews the row every
    /// 700 ms. Five consecutive renewal failures cancel `op_cancel`; a
    /// missing row stops the loop silently (implicit release).
    pub async fn acquire(
        &self,
        params: LockRepoParams,
        op_cancel: CancellationToken,
    ) -> AppResult<String> {
        for attempt in 0..=LOCK_RETRY_LIMIT {
            if op_cancel.is_cancelled() {
                return Err(AppError::Core(plandex_core::CoreError::Canceled));
            }

            match self.try_acquire(&params)? {
                Some(lock_id) => {
                    tracing::debug!(
                        plan_id = %params.plan_id,
                        branch = params.branch.as_deref().unwrap_or(""),
                        scope = params.scope.as_str(),
                        reason = %params.reason,
                        lock_id = %lock_id,
                        "lock acquired"
                    );
                    self.spawn_heartbeat(lock_id.clone(), params.reason.clone(), op_cancel.clone());
                    return Ok(lock_id);
                }
                None => {
                    if attempt == LOCK_RETRY_LIMIT {
                        break;
                    }
                    tracing::debug!(
                        plan_id = %params.plan_id,
                        reason = %params.reason,
                        attempt,
                        "lock conflict, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(LOCK_RETRY_DELAY) => {}
                        _ = op_cancel.cancelled() => {
                            return Err(AppError::Core(plandex_core::CoreError::Canceled));
                        }
                    }
                }
            }
        }

        Err(AppError::RepoLockContention)
    }

    /// Single acquisition attempt: reap expired rows, check compatibility,
    /// insert. Returns `None` on conflict.
    pub fn try_acquire(&self, params: &LockRepoParams) -> AppResult<Option<String>> {
        let conn = self.db.conn()?;

        // reap rows whose heartbeat has expired
        let expired_before = Utc::now() - LOCK_HEARTBEAT_TIMEOUT;
        conn.execute(
            "DELETE FROM repo_locks WHERE plan_id = ?1 AND last_heartbeat_at < ?2",
            params![params.plan_id, expired_before.to_rfc3339()],
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, org_id, user_id, plan_id, plan_build_id, scope, branch,
                    last_heartbeat_at, created_at
             FROM repo_locks WHERE plan_id = ?1",
        )?;
        let locks = stmt
            .query_map(params![params.plan_id], row_to_lock)?
            .collect::<Result<Vec<_>, _>>()?;

        if !can_acquire(&locks, params.scope, params.branch.as_deref()) {
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO repo_locks
                (id, org_id, user_id, plan_id, plan_build_id, scope, branch, reason,
                 last_heartbeat_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                params.org_id,
                params.user_id,
                params.plan_id,
                params.plan_build_id,
                params.scope.as_str(),
                params.branch,
                params.reason,
                now,
            ],
        )?;

        Ok(Some(id))
    }

    /// Release a lock. Tolerates a row already reaped by a contender.
    pub fn release(&self, lock_id: &str) -> AppResult<()> {
        let conn = self.db.conn()?;
        let deleted = conn.execute("DELETE FROM repo_locks WHERE id = ?1", params![lock_id])?;
        if deleted == 0 {
            tracing::debug!(lock_id, "lock already released or reaped");
        }
        Ok(())
    }

    /// Live (non-expired) locks for a plan.
    pub fn live_locks(&self, plan_id: &str) -> AppResult<Vec<RepoLock>> {
        let conn = self.db.conn()?;
        let expired_before = Utc::now() - LOCK_HEARTBEAT_TIMEOUT;
        let mut stmt = conn.prepare(
            "SELECT id, org_id, user_id, plan_id, plan_build_id, scope, branch,
                    last_heartbeat_at, created_at
             FROM repo_locks WHERE plan_id = ?1 AND last_heartbeat_at >= ?2",
        )?;
        let locks = stmt
            .query_map(params![plan_id, expired_before.to_rfc3339()], row_to_lock)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locks)
    }

    /// Delete every lock this process still holds; run at shutdown.
    pub fn cleanup_all(&self) -> AppResult<usize> {
        let conn = self.db.conn()?;
        let deleted = conn.execute("DELETE FROM repo_locks", [])?;
        Ok(deleted)
    }

    fn spawn_heartbeat(&self, lock_id: String, reason: String, op_cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut consecutive_failures = 0usize;
            loop {
                tokio::select! {
                    _ = op_cancel.cancelled() => return,
                    _ = tokio::time::sleep(LOCK_HEARTBEAT_INTERVAL) => {}
                }

                match store.update_heartbeat(&lock_id) {
                    Ok(true) => {
                        consecutive_failures = 0;
                    }
                    Ok(false) => {
                        // row gone: released or reaped, stop quietly
                        tracing::debug!(lock_id, reason, "heartbeat row missing, stopping");
                        return;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        tracing::warn!(
                            lock_id,
                            reason,
                            consecutive_failures,
                            error = %err,
                            "heartbeat update failed"
                        );
                        if consecutive_failures >= LOCK_HEARTBEAT_MAX_FAILURES {
                            tracing::error!(lock_id, reason, "heartbeat failing, canceling op");
                            op_cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });
    }

    fn update_heartbeat(&self, lock_id: &str) -> AppResult<bool> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE repo_locks SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), lock_id],
        )?;
        Ok(updated > 0)
    }
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoLock> {
    let scope: String = row.get(5)?;
    let heartbeat: String = row.get(7)?;
    let created: String = row.get(8)?;
    Ok(RepoLock {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        plan_id: row.get(3)?,
        plan_build_id: row.get(4)?,
        scope: LockScope::from_str(&scope),
        branch: row.get(6)?,
        last_heartbeat_at: parse_time(&heartbeat),
        created_at: parse_time(&created),
    })
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Compatibility rules against the live row set:
/// - a read succeeds iff every existing lock is a read on the same branch
/// - a write succeeds iff there is no other lock on the same branch
fn can_acquire(locks: &[RepoLock], scope: LockScope, branch: Option<&str>) -> bool {
    for lock in locks {
        let lock_branch = lock.branch.as_deref();
        match scope {
            LockScope::Read => {
                if lock.scope == LockScope::Write || lock_branch != branch {
                    return false;
                }
            }
            LockScope::Write => {
                if lock_branch == branch {
                    return false;
                }
            }
        }
    }
    true
}
