//! Repo Operation Queue
//!
//! Every mutation of a plan's on-disk state passes through a per-plan FIFO.
//! The head of the queue decides the batch: writes (and root-plan reads with
//! no branch) run alone; consecutive reads on the same branch batch together
//! and run concurrently. The worker holds a distributed lock for the batch,
//! checks out the branch, and hands the repo to each operation's closure.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::storage::locks::{LockRepoParams, LockScope, LockStore};
use crate::storage::GitRepo;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths;
use plandex_core::CoreError;

/// The work a repo operation performs against the checked-out working copy.
pub type RepoOpFn = Box<dyn FnOnce(&GitRepo) -> AppResult<()> + Send + 'static>;

/// Descriptor for a queued operation.
#[derive(Debug, Clone)]
pub struct RepoOpParams {
    pub org_id: String,
    pub user_id: Option<String>,
    pub plan_id: String,
    /// Empty = root plan scope (no branch checkout, runs alone)
    pub branch: String,
    pub scope: LockScope,
    pub plan_build_id: Option<String>,
    pub reason: String,
    pub cancel: CancellationToken,
    /// Discard uncommitted tree changes if this op is a failing write
    pub clear_repo_on_err: bool,
}

struct RepoOperation {
    params: RepoOpParams,
    op: RepoOpFn,
    done: oneshot::Sender<AppResult<()>>,
}

#[derive(Default)]
struct PlanQueueState {
    ops: Vec<RepoOperation>,
    is_processing: bool,
}

/// Per-plan serializer for git/FS mutations with distributed locking.
pub struct RepoOpQueue {
    queues: Mutex<HashMap<String, Arc<Mutex<PlanQueueState>>>>,
    lock_store: LockStore,
    base_dir: PathBuf,
}

impl RepoOpQueue {
    pub fn new(lock_store: LockStore, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            lock_store,
            base_dir: base_dir.into(),
        }
    }

    /// The working copy for a plan.
    pub fn repo(&self, org_id: &str, plan_id: &str) -> GitRepo {
        GitRepo::new(paths::plan_dir(&self.base_dir, org_id, plan_id))
    }

    /// Enqueue an operation and wait for it to complete.
    pub async fn exec(self: &Arc<Self>, params: RepoOpParams, op: RepoOpFn) -> AppResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = params.cancel.clone();
        let plan_id = params.plan_id.clone();
        let reason = params.reason.clone();

        tracing::debug!(plan_id, reason, "enqueueing repo operation");

        self.add(RepoOperation {
            params,
            op,
            done: done_tx,
        });

        tokio::select! {
            res = done_rx => match res {
                Ok(res) => res,
                Err(_) => Err(AppError::internal("repo operation dropped without completing")),
            },
            _ = cancel.cancelled() => Err(AppError::Core(CoreError::Canceled)),
        }
    }

    fn add(self: &Arc<Self>, op: RepoOperation) {
        let plan_id = op.params.plan_id.clone();
        let queue = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues.entry(plan_id.clone()).or_default().clone()
        };

        let should_start = {
            let mut state = queue.lock().unwrap_or_else(|e| e.into_inner());
            state.ops.push(op);
            if state.is_processing {
                false
            } else {
                state.is_processing = true;
                true
            }
        };

        if should_start {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_queue(plan_id, queue).await;
            });
        }
    }

    /// Pop the next batch. A write head or empty-branch head runs alone;
    /// a read head on a named branch pulls in consecutive same-branch reads.
    fn next_batch(queue: &Mutex<PlanQueueState>) -> Vec<RepoOperation> {
        let mut state = queue.lock().unwrap_or_else(|e| e.into_inner());
        if state.ops.is_empty() {
            state.is_processing = false;
            return Vec::new();
        }

        let first = state.ops.remove(0);
        let first_scope = first.params.scope;
        let first_branch = first.params.branch.clone();
        let mut batch = vec![first];

        if first_scope == LockScope::Write || first_branch.is_empty() {
            return batch;
        }

        while let Some(next) = state.ops.first() {
            if next.params.scope == LockScope::Read && next.params.branch == first_branch {
                batch.push(state.ops.remove(0));
            } else {
                break;
            }
        }

        batch
    }

    async fn run_queue(self: Arc<Self>, plan_id: String, queue: Arc<Mutex<PlanQueueState>>) {
        loop {
            let batch = Self::next_batch(&queue);
            if batch.is_empty() {
                tracing::debug!(plan_id, "repo queue drained");
                return;
            }
            self.run_batch(batch).await;
        }
    }

    async fn run_batch(&self, batch: Vec<RepoOperation>) {
        // operations canceled while queued fail without touching the lock
        let (live, canceled): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|op| !op.params.cancel.is_cancelled());
        for op in canceled {
            let _ = op.done.send(Err(AppError::Core(CoreError::Canceled)));
        }
        if live.is_empty() {
            return;
        }

        let first = &live[0].params;
        let lock_params = LockRepoParams {
            org_id: first.org_id.clone(),
            user_id: first.user_id.clone(),
            plan_id: first.plan_id.clone(),
            branch: if first.branch.is_empty() {
                None
            } else {
                Some(first.branch.clone())
            },
            scope: first.scope,
            plan_build_id: first.plan_build_id.clone(),
            reason: first.reason.clone(),
        };

        let lock_id = match self
            .lock_store
            .acquire(lock_params, first.cancel.clone())
            .await
        {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    plan_id = %first.plan_id,
                    reason = %first.reason,
                    error = %err,
                    "failed to acquire repo lock"
                );
                let msg = err.to_string();
                for op in live {
                    let _ = op
                        .done
                        .send(Err(AppError::database(format!("failed to get lock: {}", msg))));
                }
                return;
            }
        };

        let repo = self.repo(&first.org_id, &first.plan_id);
        let branch = first.branch.clone();
        let plan_id = first.plan_id.clone();

        // recover from a prior worker crashing mid-commit, then checkout
        let setup_repo = repo.clone();
        let setup_branch = branch.clone();
        let setup = tokio::task::spawn_blocking(move || -> AppResult<()> {
            setup_repo.remove_stale_index_lock()?;
            if !setup_branch.is_empty() {
                setup_repo.checkout(&setup_branch)?;
            }
            Ok(())
        })
        .await
        .unwrap_or_else(|e| Err(AppError::Panic(e.to_string())));

        if let Err(err) = setup {
            tracing::error!(plan_id, error = %err, "repo setup failed");
            let msg = err.to_string();
            for op in live {
                let _ = op.done.send(Err(AppError::git(msg.clone())));
            }
            let _ = self.lock_store.release(&lock_id);
            return;
        }

        // run the batch concurrently; writes are single-op batches by construction
        let mut handles = Vec::with_capacity(live.len());
        for operation in live {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let RepoOperation { params, op, done } = operation;

                if params.cancel.is_cancelled() {
                    let _ = done.send(Err(AppError::Core(CoreError::Canceled)));
                    return false;
                }

                let result = tokio::task::spawn_blocking(move || {
                    std::panic::catch_unwind(AssertUnwindSafe(|| op(&repo)))
                        .unwrap_or_else(|p| Err(AppError::Panic(panic_message(p))))
                })
                .await
                .unwrap_or_else(|e| Err(AppError::Panic(e.to_string())));

                let needs_rollback = result.is_err()
                    && params.scope == LockScope::Write
                    && params.clear_repo_on_err;

                if let Err(err) = &result {
                    tracing::warn!(
                        plan_id = %params.plan_id,
                        reason = %params.reason,
                        error = %err,
                        "repo operation failed"
                    );
                }

                let _ = done.send(result);
                needs_rollback
            }));
        }

        let mut needs_rollback = false;
        for handle in handles {
            needs_rollback |= handle.await.unwrap_or(false);
        }

        if needs_rollback {
            tracing::warn!(plan_id, branch, "rolling back uncommitted changes");
            let rollback_repo = repo.clone();
            let res = tokio::task::spawn_blocking(move || rollback_repo.clear_uncommitted_changes())
                .await
                .unwrap_or_else(|e| Err(AppError::Panic(e.to_string())));
            if let Err(err) = res {
                tracing::error!(plan_id, error = %err, "rollback failed");
            }
        }

        if let Err(err) = self.lock_store.release(&lock_id) {
            tracing::error!(plan_id, lock_id, error = %err, "failed to release repo lock");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (tempfile::TempDir, Arc<RepoOpQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LockStore::new(Database::new_in_memory().unwrap());
        let queue = Arc::new(RepoOpQueue::new(store, dir.path()));
        (dir, queue)
    }

    fn init_plan_repo(queue: &RepoOpQueue, org: &str, plan: &str) {
        queue.repo(org, plan).init().unwrap();
    }

    fn params(plan_id: &str, branch: &str, scope: LockScope) -> RepoOpParams {
        RepoOpParams {
            org_id: "org-1".into(),
            user_id: Some("user-1".into()),
            plan_id: plan_id.into(),
            branch: branch.into(),
            scope,
            plan_build_id: None,
            reason: "test".into(),
            cancel: CancellationToken::new(),
            clear_repo_on_err: false,
        }
    }

    #[tokio::test]
    async fn test_write_op_commits() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        queue
            .exec(
                params("p1", "main", LockScope::Write),
                Box::new(|repo| {
                    std::fs::write(repo.dir().join("file.txt"), "data")?;
                    repo.add_and_commit("add file")?;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let repo = queue.repo("org-1", "p1");
        assert_eq!(repo.latest_commit_message().unwrap(), "add file");
    }

    #[tokio::test]
    async fn test_ops_run_in_enqueue_order() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            let queue = Arc::clone(&queue);
            joins.push(tokio::spawn(async move {
                queue
                    .exec(
                        params("p1", "main", LockScope::Write),
                        Box::new(move |_repo| {
                            order.lock().unwrap().push(i);
                            Ok(())
                        }),
                    )
                    .await
            }));
            // give each enqueue a moment so ordering is deterministic
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_error() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        let res = queue
            .exec(
                params("p1", "main", LockScope::Write),
                Box::new(|_repo| panic!("boom")),
            )
            .await;
        assert!(matches!(res, Err(AppError::Panic(msg)) if msg.contains("boom")));

        // the queue still works after a panic
        queue
            .exec(params("p1", "main", LockScope::Read), Box::new(|_repo| Ok(())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_write_clears_tree_when_requested() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        let mut p = params("p1", "main", LockScope::Write);
        p.clear_repo_on_err = true;

        let res = queue
            .exec(
                p,
                Box::new(|repo| {
                    std::fs::write(repo.dir().join("dirty.txt"), "dirty")?;
                    Err(AppError::internal("write failed"))
                }),
            )
            .await;
        assert!(res.is_err());

        let repo = queue.repo("org-1", "p1");
        assert!(!repo.has_uncommitted_changes().unwrap());
    }

    #[tokio::test]
    async fn test_canceled_op_fails_without_running() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        let ran = Arc::new(AtomicUsize::new(0));
        let mut p = params("p1", "main", LockScope::Write);
        p.cancel.cancel();
        let cancel = p.cancel.clone();
        // cancel already fired; ensure exec returns Canceled and fn never runs
        let ran_in = Arc::clone(&ran);
        let res = queue
            .exec(
                p,
                Box::new(move |_repo| {
                    ran_in.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
        assert!(cancel.is_cancelled());
        assert!(res.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reads_batch_together() {
        let (_dir, queue) = setup();
        init_plan_repo(&queue, "org-1", "p1");

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        // a slow read head lets later reads pile up and batch with it
        let mut joins = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            joins.push(tokio::spawn(async move {
                queue
                    .exec(
                        params("p1", "main", LockScope::Read),
                        Box::new(move |_repo| {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(100));
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }),
                    )
                    .await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        // at least two reads overlapped in one batch
        assert!(max_seen.load(Ordering::SeqCst) >= 2);
    }
}
