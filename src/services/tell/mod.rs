//! Tell Pipeline
//!
//! Drives a plan through the streaming model conversation: stage resolution,
//! plan loading under repo locks, prompt assembly within the token budget,
//! the stream listen loop with missing-file pausing, and the auto-continue
//! iteration cycle. Completed file operations are handed to the build
//! pipeline as they stream.

pub mod finish;
pub mod load;
pub mod prompt;
pub mod stage;
pub mod stream;
pub mod subtasks;

mod state;

pub use state::TellState;

use std::sync::Arc;

use crate::models::{Plan, PlanStatus, TellRequest};
use crate::services::active::{ActivePlan, MissingFileChoice};
use crate::state::ServerState;
use crate::utils::error::AppResult;

/// Start a tell: register the active plan and spawn the first iteration.
pub async fn tell(
    server: Arc<ServerState>,
    plan: Plan,
    branch: &str,
    user_id: &str,
    req: TellRequest,
) -> AppResult<Arc<ActivePlan>> {
    let active = server.registry.activate(
        &plan.org_id,
        user_id,
        &plan.id,
        branch,
        &req.prompt,
        false,
        req.auto_context,
        &req.session_id,
    )?;

    let should_build_pending = req.build_mode == crate::models::BuildMode::Auto;

    spawn_exec_tell_plan(ExecTellParams {
        server,
        plan,
        branch: branch.to_string(),
        user_id: user_id.to_string(),
        req,
        iteration: 0,
        missing_file_response: None,
        should_build_pending,
    });

    Ok(active)
}

/// Parameters for one tell iteration.
#[derive(Clone)]
pub struct ExecTellParams {
    pub server: Arc<ServerState>,
    pub plan: Plan,
    pub branch: String,
    pub user_id: String,
    pub req: TellRequest,
    pub iteration: usize,
    pub missing_file_response: Option<MissingFileChoice>,
    pub should_build_pending: bool,
}

/// Spawn one iteration of the tell loop.
pub fn spawn_exec_tell_plan(params: ExecTellParams) {
    tokio::spawn(async move {
        exec_tell_plan(params).await;
    });
}

async fn exec_tell_plan(params: ExecTellParams) {
    let server = Arc::clone(&params.server);
    let plan_id = params.plan.id.clone();
    let branch = params.branch.clone();

    tracing::info!(plan_id, branch, iteration = params.iteration, "exec tell plan");

    let Some(active) = server.registry.get(&plan_id, &branch) else {
        tracing::warn!(plan_id, branch, "exec_tell_plan: no active plan");
        return;
    };
    active.set_status(PlanStatus::Replying);

    let mut state = match TellState::load(params).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(plan_id, branch, error = %err, "failed to load tell plan");
            server.registry.fail(&plan_id, &branch, err.to_api_error()).await;
            return;
        }
    };

    if let Err(err) = stream::run_iteration(&mut state).await {
        if err.is_canceled() {
            tracing::info!(plan_id, branch, "tell iteration canceled");
            return;
        }
        tracing::error!(plan_id, branch, error = %err, "tell iteration failed");
        finish::store_error_artifacts(&state, &err).await;
        server.registry.fail(&plan_id, &branch, err.to_api_error()).await;
    }
}
