//! Server State
//!
//! The injected environment threaded through every pipeline: the active-plan
//! registry, the repo operation queue, the lock store, and the model
//! provider. There are no ambient singletons; everything reaches its
//! collaborators through this struct.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plandex_llm::ModelProvider;

use crate::services::active::ActiveRegistry;
use crate::services::queue::RepoOpQueue;
use crate::storage::{Database, GitRepo, LockStore, PlanFs};
use crate::utils::error::AppResult;
use crate::utils::paths;

pub struct ServerState {
    pub registry: ActiveRegistry,
    pub queue: Arc<RepoOpQueue>,
    pub lock_store: LockStore,
    pub provider: Arc<dyn ModelProvider>,
    base_dir: PathBuf,
}

impl ServerState {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        db: Database,
        provider: Arc<dyn ModelProvider>,
    ) -> Arc<Self> {
        let base_dir = base_dir.into();
        let lock_store = LockStore::new(db);
        let queue = Arc::new(RepoOpQueue::new(lock_store.clone(), base_dir.clone()));
        Arc::new(Self {
            registry: ActiveRegistry::new(),
            queue,
            lock_store,
            provider,
            base_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File store for a plan's directory.
    pub fn plan_fs(&self, org_id: &str, plan_id: &str) -> PlanFs {
        PlanFs::new(paths::plan_dir(&self.base_dir, org_id, plan_id))
    }

    /// A plan's git working copy (only touch it through the queue).
    pub fn plan_repo(&self, org_id: &str, plan_id: &str) -> GitRepo {
        self.queue.repo(org_id, plan_id)
    }

    /// Initialize a plan's directory: artifact dirs plus an empty git repo
    /// with a main branch.
    pub fn create_plan_dir(&self, org_id: &str, plan_id: &str) -> AppResult<()> {
        let fs = self.plan_fs(org_id, plan_id);
        fs.init()?;
        let repo = self.plan_repo(org_id, plan_id);
        repo.init()?;
        Ok(())
    }
}
