//! Build Pipeline
//!
//! Converts proposed file operations into validated `PlanFileResult`s. Builds
//! for one path run strictly in queue order; different paths build
//! concurrently. Each file edit runs the validate/correct loop with a
//! whole-file fallback racing it when the model flags the proposal as
//! incorrect.

pub mod diff;
pub mod line_nums;
pub mod race;
pub mod validate;
pub mod whole_file;

use std::sync::{Arc, Mutex};

use plandex_core::stream::{BuildInfo, StreamMessage};
use tokio_util::sync::CancellationToken;

use crate::models::{PlanBuild, PlanFileResult, PlanSettings};
use crate::services::active::{ActiveBuild, ActivePlan};
use crate::services::queue::RepoOpParams;
use crate::state::ServerState;
use crate::storage::locks::LockScope;
use crate::utils::error::{AppError, AppResult};

/// Shared, immutable inputs for building one file.
#[derive(Clone)]
pub struct FileBuildCtx {
    pub server: Arc<ServerState>,
    pub org_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub branch: String,
    pub settings: PlanSettings,
    pub path: String,
    /// Pre-build state: current plan content, else context body, else empty
    pub original: String,
    pub proposed: String,
    pub desc: String,
    pub build_id: String,
    pub convo_message_id: String,
    pub cancel: CancellationToken,
}

impl FileBuildCtx {
    /// Syntax errors in `content`, empty when no parser applies or the check
    /// timed out.
    pub async fn validate_syntax(&self, content: &str) -> Vec<String> {
        let res = plandex_syntax::validate(&self.path, content).await;
        if res.will_check_syntax() && !res.valid {
            res.errors
        } else {
            Vec::new()
        }
    }
}

/// Orchestrates the builds of one plan stream.
pub struct BuildRunner {
    pub server: Arc<ServerState>,
    pub org_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub branch: String,
    pub settings: PlanSettings,
}

impl BuildRunner {
    pub fn new(
        server: Arc<ServerState>,
        org_id: &str,
        user_id: &str,
        plan_id: &str,
        branch: &str,
        settings: PlanSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            branch: branch.to_string(),
            settings,
        })
    }

    fn active_plan(&self) -> Option<Arc<ActivePlan>> {
        self.server.registry.get(&self.plan_id, &self.branch)
    }

    /// Queue builds onto their per-path queues, starting a worker for every
    /// path that doesn't have one running.
    pub fn queue_builds(self: &Arc<Self>, builds: Vec<Arc<ActiveBuild>>) {
        let Some(active) = self.active_plan() else {
            tracing::warn!(plan_id = %self.plan_id, "queue_builds: no active plan");
            return;
        };

        for build in builds {
            let path = build.path.clone();
            let should_start = active.queue_build(build);
            tracing::debug!(path, should_start, "queued build");
            if should_start {
                let runner = Arc::clone(self);
                tokio::spawn(async move {
                    runner.run_path_builds(&path).await;
                });
            }
        }
    }

    /// Resume builds for descriptions whose operations were never built.
    pub async fn build_pending(self: &Arc<Self>) -> AppResult<usize> {
        let fs = self.server.plan_fs(&self.org_id, &self.plan_id);
        let descs = {
            let fs = fs.clone();
            let result = Arc::new(Mutex::new(Vec::new()));
            let result_in = Arc::clone(&result);
            self.exec_repo_op(
                LockScope::Read,
                "load pending builds",
                false,
                Box::new(move |_repo| {
                    *result_in.lock().unwrap_or_else(|e| e.into_inner()) =
                        fs.load_descriptions()?;
                    Ok(())
                }),
            )
            .await?;
            Arc::try_unwrap(result)
                .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
                .unwrap_or_default()
        };

        let mut builds = Vec::new();
        for desc in descs.iter().filter(|d| {
            d.applied_at.is_none()
                && d.error.is_none()
                && !d.operations.is_empty()
                && (!d.did_build || !d.build_paths_invalidated.is_empty())
        }) {
            for op in &desc.operations {
                // rebuild everything for never-built descriptions, and just
                // the invalidated paths for already-built ones
                if desc.did_build && !desc.build_paths_invalidated.contains_key(&op.path) {
                    continue;
                }
                builds.push(ActiveBuild::from_operation(
                    &desc.convo_message_id,
                    op,
                    op.num_tokens,
                ));
            }
        }

        let count = builds.len();
        if count > 0 {
            tracing::info!(count, "resuming pending builds");
            self.queue_builds(builds);
        }
        Ok(count)
    }

    /// Drain one path's queue, then check whether the whole build finished.
    async fn run_path_builds(self: &Arc<Self>, path: &str) {
        loop {
            let Some(active) = self.active_plan() else {
                return;
            };
            match active.next_queued_build(path) {
                Some(build) => self.exec_build(build).await,
                None => {
                    let all_finished = active.finish_path_build(path);
                    // a build may have been queued between the empty check
                    // and marking the path idle; reclaim it if so
                    if active.next_queued_build(path).is_some() {
                        active.update(|s| {
                            s.is_building_by_path.insert(path.to_string(), true);
                        });
                        continue;
                    }
                    if all_finished {
                        self.on_finish_build().await;
                    }
                    return;
                }
            }
        }
    }

    /// Build one queued entry for its path.
    async fn exec_build(self: &Arc<Self>, build: Arc<ActiveBuild>) {
        let Some(active) = self.active_plan() else {
            return;
        };
        let path = build.path.clone();

        active.stream(StreamMessage::BuildInfo {
            info: BuildInfo {
                path: path.clone(),
                num_tokens: 0,
                finished: false,
                removed: false,
            },
        });

        let pre_build_state = match self.resolve_pre_build_state(&path).await {
            Ok(state) => state,
            Err(err) => {
                self.on_build_error(&active, &build, err).await;
                return;
            }
        };

        let plan_build = PlanBuild::new(&self.plan_id, &build.reply_id, &path);

        if build.is_move_op {
            // a move is a remove at the source plus a synthetic file write of
            // the pre-build state at the destination
            let Some(destination) = build.move_destination.clone() else {
                self.on_build_error(
                    &active,
                    &build,
                    AppError::build_failure(&path, "move operation without destination"),
                )
                .await;
                return;
            };
            let remove = ActiveBuild::remove_build(&build.reply_id, &path);
            let file = ActiveBuild::file_build(
                &build.reply_id,
                &destination,
                &pre_build_state,
                &build.file_description,
            );
            build.mark_success();
            self.queue_builds(vec![remove, file]);
            return;
        }

        if build.is_remove_op {
            let mut result =
                PlanFileResult::new(&self.plan_id, &plan_build.id, &build.reply_id, &path);
            result.removed_file = true;
            self.finish_build_file(&active, &build, result, true).await;
            return;
        }

        if build.is_reset_op {
            let context_body = active.read(|s| {
                s.contexts_by_path.get(&path).map(|c| c.body.clone())
            });
            match context_body {
                Some(body) => {
                    let mut result =
                        PlanFileResult::new(&self.plan_id, &plan_build.id, &build.reply_id, &path);
                    result.content = body;
                    self.finish_build_file(&active, &build, result, false).await;
                }
                None => {
                    // nothing to reset to: treat as a removal
                    let remove = ActiveBuild::remove_build(&build.reply_id, &path);
                    build.mark_success();
                    self.queue_builds(vec![remove]);
                }
            }
            return;
        }

        // plain file write
        if pre_build_state.is_empty() {
            let validation = plandex_syntax::validate(&path, &build.file_content).await;
            let mut result =
                PlanFileResult::new(&self.plan_id, &plan_build.id, &build.reply_id, &path);
            result.content = build.file_content.clone();
            result.will_check_syntax = validation.will_check_syntax();
            result.syntax_valid = validation.valid;
            result.syntax_errors = validation.errors;
            self.finish_build_file(&active, &build, result, false).await;
            return;
        }

        // edit of an existing file: validate/correct with whole-file race
        let ctx = FileBuildCtx {
            server: Arc::clone(&self.server),
            org_id: self.org_id.clone(),
            user_id: self.user_id.clone(),
            plan_id: self.plan_id.clone(),
            branch: self.branch.clone(),
            settings: self.settings.clone(),
            path: path.clone(),
            original: pre_build_state,
            proposed: build.file_content.clone(),
            desc: build.file_description.clone(),
            build_id: plan_build.id.clone(),
            convo_message_id: build.reply_id.clone(),
            cancel: active.ctx.child_token(),
        };

        let initial_syntax_errors = ctx.validate_syntax(&ctx.proposed).await;

        let updated = match race::build_race(&ctx, initial_syntax_errors).await {
            Ok(updated) => updated,
            Err(err) => {
                self.on_build_error(&active, &build, err).await;
                return;
            }
        };

        let validation = plandex_syntax::validate(&path, &updated).await;
        let mut replacements = diff::diff_replacements(&ctx.original, &updated);
        for replacement in &mut replacements {
            replacement.summary = ctx.desc.trim().to_string();
        }

        let mut result = PlanFileResult::new(&self.plan_id, &plan_build.id, &build.reply_id, &path);
        result.replacements = replacements;
        result.will_check_syntax = validation.will_check_syntax();
        result.syntax_valid = validation.valid;
        result.syntax_errors = validation.errors;

        self.finish_build_file(&active, &build, result, false).await;
    }

    /// Current content of `path` from the in-memory pending plan, else the
    /// matching context body, else empty (new file).
    async fn resolve_pre_build_state(&self, path: &str) -> AppResult<String> {
        let fs = self.server.plan_fs(&self.org_id, &self.plan_id);
        let files = {
            let fs = fs.clone();
            let result = Arc::new(Mutex::new(None));
            let result_in = Arc::clone(&result);
            self.exec_repo_op(
                LockScope::Read,
                "load build file",
                false,
                Box::new(move |_repo| {
                    *result_in.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(fs.current_plan_files()?);
                    Ok(())
                }),
            )
            .await?;
            Arc::try_unwrap(result)
                .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
                .ok()
                .flatten()
                .unwrap_or_default()
        };

        if let Some(content) = files.get(path) {
            return Ok(content.clone());
        }

        if let Some(active) = self.active_plan() {
            if let Some(body) =
                active.read(|s| s.contexts_by_path.get(path).map(|c| c.body.clone()))
            {
                return Ok(body);
            }
        }

        Ok(String::new())
    }

    /// Persist the result under a write lock, then advance the path queue.
    async fn finish_build_file(
        self: &Arc<Self>,
        active: &Arc<ActivePlan>,
        build: &Arc<ActiveBuild>,
        result: PlanFileResult,
        removed: bool,
    ) {
        let path = build.path.clone();
        let fs = self.server.plan_fs(&self.org_id, &self.plan_id);
        let store_result = result.clone();

        let res = self
            .exec_repo_op(
                LockScope::Write,
                "store plan result",
                true,
                Box::new(move |_repo| fs.store_result(&store_result)),
            )
            .await;

        if let Err(err) = res {
            self.on_build_error(active, build, err).await;
            return;
        }

        active.stream(StreamMessage::BuildInfo {
            info: BuildInfo {
                path: path.clone(),
                num_tokens: 0,
                finished: true,
                removed,
            },
        });
        active.update(|s| s.did_edit_files = true);

        build.mark_success();
        tracing::debug!(path, "build finished");
    }

    /// All paths drained: mark descriptions built and commit, then finish
    /// the plan if replies are done too.
    async fn on_finish_build(self: &Arc<Self>) {
        let Some(active) = self.active_plan() else {
            return;
        };

        // wait for the streaming reply to be stored so descriptions exist
        let streaming_reply = active.read(|s| s.current_streaming_reply_id.clone());
        if let Some(reply_id) = streaming_reply {
            active.wait_for_reply_stored(&reply_id).await;
        }

        // more builds may have been queued while waiting
        let Some(active) = self.active_plan() else {
            return;
        };
        if !active.build_finished() {
            tracing::debug!("builds queued while waiting for reply; not finishing");
            return;
        }

        let fs = self.server.plan_fs(&self.org_id, &self.plan_id);
        let res = self
            .exec_repo_op(
                LockScope::Write,
                "finish build",
                true,
                Box::new(move |repo| {
                    let mut commit_lines = Vec::new();
                    for mut desc in fs.load_descriptions()? {
                        if !desc.operations.is_empty()
                            && (!desc.did_build || !desc.build_paths_invalidated.is_empty())
                        {
                            desc.did_build = true;
                            desc.build_paths_invalidated.clear();
                            fs.store_description(&desc)?;
                            if !desc.commit_msg.is_empty() {
                                commit_lines.push(format!("- {}", desc.commit_msg));
                            }
                        }
                    }

                    let message = if commit_lines.is_empty() {
                        "Built pending changes".to_string()
                    } else {
                        format!("Built pending changes\n\n{}", commit_lines.join("\n"))
                    };
                    repo.add_and_commit(&message)?;
                    Ok(())
                }),
            )
            .await;

        if let Err(err) = res {
            if err.is_canceled() {
                return;
            }
            tracing::error!(error = %err, "error finishing build");
            self.server
                .registry
                .fail(&self.plan_id, &self.branch, err.to_api_error())
                .await;
            return;
        }

        let Some(active) = self.active_plan() else {
            return;
        };
        let (replies_finished, build_only) =
            active.read(|s| (s.replies_finished, active.build_only));
        if replies_finished || build_only {
            tracing::info!(plan_id = %self.plan_id, "replies and builds drained, finishing plan");
            self.server.registry.finish(&self.plan_id, &self.branch).await;
        }
    }

    /// A build failure is surfaced per-path and does not cancel other builds.
    async fn on_build_error(
        self: &Arc<Self>,
        active: &Arc<ActivePlan>,
        build: &Arc<ActiveBuild>,
        err: AppError,
    ) {
        if err.is_canceled() {
            build.mark_error("canceled");
            return;
        }
        tracing::error!(path = %build.path, error = %err, "build failed");
        build.mark_error(err.to_string());

        active.stream(StreamMessage::BuildInfo {
            info: BuildInfo {
                path: build.path.clone(),
                num_tokens: 0,
                finished: true,
                removed: false,
            },
        });
    }

    async fn exec_repo_op(
        &self,
        scope: LockScope,
        reason: &str,
        clear_repo_on_err: bool,
        op: crate::services::queue::RepoOpFn,
    ) -> AppResult<()> {
        let cancel = self
            .active_plan()
            .map(|a| a.ctx.clone())
            .unwrap_or_default();
        self.server
            .queue
            .exec(
                RepoOpParams {
                    org_id: self.org_id.clone(),
                    user_id: Some(self.user_id.clone()),
                    plan_id: self.plan_id.clone(),
                    branch: self.branch.clone(),
                    scope,
                    plan_build_id: None,
                    reason: reason.to_string(),
                    cancel,
                    clear_repo_on_err,
                },
                op,
            )
            .await
    }
}
