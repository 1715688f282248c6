//! Active Plan Registry
//!
//! Process-wide map of `(planId, branch)` to the in-flight `ActivePlan`,
//! guarded by a reader-writer lock. At most one active plan exists per key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use plandex_core::stream::StreamMessage;

use super::plan::ActivePlan;
use crate::utils::error::{AppError, AppResult};

/// Registry of in-flight plans.
#[derive(Default)]
pub struct ActiveRegistry {
    plans: RwLock<HashMap<(String, String), Arc<ActivePlan>>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(plan_id: &str, branch: &str) -> (String, String) {
        (plan_id.to_string(), branch.to_string())
    }

    /// Insert a fresh active plan. Fails if one already exists for the key.
    #[allow(clippy::too_many_arguments)]
    pub fn activate(
        &self,
        org_id: &str,
        user_id: &str,
        plan_id: &str,
        branch: &str,
        prompt: &str,
        build_only: bool,
        auto_context: bool,
        session_id: &str,
    ) -> AppResult<Arc<ActivePlan>> {
        let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
        let key = Self::key(plan_id, branch);
        if plans.contains_key(&key) {
            return Err(AppError::user_input(format!(
                "plan {} branch {} already has an active stream",
                plan_id, branch
            )));
        }

        let plan = ActivePlan::new(
            org_id,
            user_id,
            plan_id,
            branch,
            prompt,
            build_only,
            auto_context,
            session_id,
        );
        plans.insert(key, Arc::clone(&plan));
        tracing::info!(plan_id, branch, "activated plan");
        Ok(plan)
    }

    pub fn get(&self, plan_id: &str, branch: &str) -> Option<Arc<ActivePlan>> {
        self.plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(plan_id, branch))
            .cloned()
    }

    /// Apply a mutation to the active plan's state while holding the map's
    /// read side (entries themselves are internally synchronized).
    pub fn update<R>(
        &self,
        plan_id: &str,
        branch: &str,
        f: impl FnOnce(&mut super::plan::ActivePlanState) -> R,
    ) -> Option<R> {
        self.get(plan_id, branch).map(|plan| plan.update(f))
    }

    /// Subscribe to a plan's stream.
    pub fn subscribe(
        &self,
        plan_id: &str,
        branch: &str,
    ) -> Option<(String, tokio::sync::mpsc::UnboundedReceiver<StreamMessage>)> {
        self.get(plan_id, branch).map(|plan| plan.subscribe())
    }

    pub fn num_active(&self) -> usize {
        self.plans.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Finish a plan: flush the buffer, send the terminal message, signal
    /// the done channel, cancel contexts, and remove the entry.
    pub async fn finish(&self, plan_id: &str, branch: &str) {
        let Some(plan) = self.get(plan_id, branch) else {
            return;
        };

        plan.flush_stream_buffer();
        plan.stream(StreamMessage::Finished);

        // let the terminal message drain to subscribers before signalling done
        tokio::time::sleep(Duration::from_millis(50)).await;
        plan.send_done(None);

        self.remove(plan_id, branch);
    }

    /// Fail a plan: emit the error to subscribers, signal done, tear down.
    pub async fn fail(&self, plan_id: &str, branch: &str, error: plandex_core::stream::ApiError) {
        let Some(plan) = self.get(plan_id, branch) else {
            return;
        };

        plan.flush_stream_buffer();
        plan.stream(StreamMessage::Error {
            error: error.clone(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        plan.send_done(Some(error));

        self.remove(plan_id, branch);
    }

    fn remove(&self, plan_id: &str, branch: &str) {
        let removed = {
            let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
            plans.remove(&Self::key(plan_id, branch))
        };
        if let Some(plan) = removed {
            plan.ctx.cancel();
            // summaries keep their own context so they can finish up
            tracing::info!(plan_id, branch, "removed active plan");
        }
    }
}
