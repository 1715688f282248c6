//! Stream Finish
//!
//! Runs when a reply finishes streaming: generates the description and
//! exec-status verdict in parallel, evaluates the reply checks, persists the
//! assistant message / description / subtasks under a write lock, kicks off
//! background summarization, and decides whether to auto-continue.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use plandex_core::limits::{AUTO_LOAD_CONTEXT_TIMEOUT, MAX_AUTO_CONTINUE_ITERATIONS};
use plandex_core::stream::StreamMessage;
use plandex_core::OperationType;
use plandex_llm::{
    create_chat_completion_stream_with_retries, estimate_tokens, ChatCompletionRequest,
    ChatMessage,
};
use serde::Deserialize;

use super::subtasks::{
    check_auto_load_context, follow_up_needs_context, parse_remove_subtasks, parse_subtasks,
    AutoLoadContextResult,
};
use super::{ExecTellParams, TellState};
use crate::models::{
    subtask, ContextType, ConvoMessage, ConvoMessageDescription, ConvoMessageFlags, PlanStatus,
    PlanningPhase, ReplyType, Subtask, TellStage, ROLE_ASSISTANT,
};
use crate::services::context::summary::new_summary;
use crate::services::exec_status::{exec_status_should_continue, ExecStatusParams};
use crate::services::prompts;
use crate::services::queue::RepoOpParams;
use crate::storage::locks::LockScope;
use crate::utils::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptionReply {
    commit_msg: String,
    #[serde(default)]
    wrote_files: bool,
}

pub async fn handle_stream_finished(state: &mut TellState) -> AppResult<()> {
    let Some(active) = state.active_plan() else {
        return Err(AppError::internal("active plan missing at stream finish"));
    };

    active.flush_stream_buffer();
    active.stream(StreamMessage::Describing);
    active.set_status(PlanStatus::Describing);

    let reply_content = active.read(|s| s.current_reply_content.clone());
    let operations = state.processor.reply_operations.clone();

    // reply checks
    let loaded_paths: HashSet<String> =
        active.read(|s| s.contexts_by_path.keys().cloned().collect());
    let auto_load = check_auto_load_context(&reply_content, &state.req.project_paths, &loaded_paths);

    let is_planning_tasks = state.current_stage.tell_stage == TellStage::Planning
        && state.current_stage.planning_phase == PlanningPhase::Tasks
        && !state.req.is_chat_only;
    let added_subtasks = if is_planning_tasks {
        parse_subtasks(&reply_content)
    } else {
        Vec::new()
    };
    let removed_subtasks = if is_planning_tasks {
        parse_remove_subtasks(&reply_content)
    } else {
        Vec::new()
    };
    let needs_context_stage = follow_up_needs_context(&reply_content);

    // description and exec-status run in parallel; neither is fatal
    let is_implementation = state.current_stage.tell_stage == TellStage::Implementation;
    let current_subtask = state.current_subtask().cloned();

    let (description_reply, exec_status) = tokio::join!(
        generate_description(state, &reply_content),
        async {
            if is_implementation {
                exec_status_should_continue(ExecStatusParams {
                    provider: Arc::clone(&state.server.provider),
                    config: &state.settings.model_pack.exec_status,
                    user_prompt: &state.user_prompt,
                    current_subtask: current_subtask.as_ref(),
                    convo: &state.convo,
                    reply_operations: &operations,
                    current_message: &reply_content,
                    cancel: active.ctx.clone(),
                })
                .await
                .subtask_finished
            } else {
                false
            }
        }
    );

    let subtask_finished = exec_status;

    // update the subtask list
    let mut subtasks = state.subtasks.clone();
    if is_implementation {
        if let Some(current) = subtask::current_subtask_mut(&mut subtasks) {
            if subtask_finished {
                current.is_finished = true;
            } else {
                current.num_tries += 1;
            }
        }
    }
    if !removed_subtasks.is_empty() {
        subtasks.retain(|t| t.is_finished || !removed_subtasks.contains(&t.title));
    }
    for task in &added_subtasks {
        if !subtasks.iter().any(|t| t.title == task.title) {
            subtasks.push(task.clone());
        }
    }
    let all_subtasks_finished = !subtasks.is_empty() && subtask::all_subtasks_finished(&subtasks);

    // assemble the assistant message
    let wrote_code = operations
        .iter()
        .any(|op| op.op_type == OperationType::File);
    let flags = ConvoMessageFlags {
        did_make_plan: !added_subtasks.is_empty(),
        did_write_code: wrote_code,
        did_load_context: !auto_load.auto_load_paths.is_empty(),
        did_complete_task: subtask_finished,
        did_complete_plan: all_subtasks_finished && is_implementation,
        has_error: false,
        current_stage: state.current_stage,
    };
    let reply_type = if state.req.is_chat_only {
        ReplyType::Chat
    } else if state.current_stage.planning_phase == PlanningPhase::Context
        && state.current_stage.tell_stage == TellStage::Planning
    {
        ReplyType::LoadedContext
    } else if !added_subtasks.is_empty() {
        ReplyType::MadePlan
    } else if is_implementation {
        ReplyType::Implementation
    } else {
        ReplyType::Chat
    };

    let assistant_message = ConvoMessage {
        id: state.reply_id.clone(),
        plan_id: state.plan.id.clone(),
        user_id: state.user_id.clone(),
        role: ROLE_ASSISTANT.to_string(),
        num: 0, // assigned under the write lock
        tokens: state.reply_num_tokens.max(estimate_tokens(&reply_content)),
        message: reply_content.clone(),
        stopped: false,
        flags,
        reply_type,
        subtask: if is_implementation {
            current_subtask.clone()
        } else {
            None
        },
        added_subtasks: added_subtasks.clone(),
        removed_subtasks: removed_subtasks.clone(),
        activated_paths: auto_load
            .activated_paths
            .iter()
            .chain(auto_load.auto_load_paths.iter())
            .map(|p| (p.clone(), true))
            .collect(),
        activated_paths_ordered: auto_load
            .activated_paths
            .iter()
            .chain(auto_load.auto_load_paths.iter())
            .cloned()
            .collect(),
        created_at: Utc::now(),
    };

    let description = ConvoMessageDescription {
        id: uuid::Uuid::new_v4().to_string(),
        plan_id: state.plan.id.clone(),
        convo_message_id: state.reply_id.clone(),
        summarized_to_message_id: state.summarized_to_message_id.clone().unwrap_or_default(),
        wrote_files: description_reply
            .as_ref()
            .map(|d| d.wrote_files)
            .unwrap_or(wrote_code),
        commit_msg: description_reply
            .map(|d| d.commit_msg)
            .unwrap_or_else(|| "Assistant reply".to_string()),
        operations: operations.clone(),
        did_build: false,
        build_paths_invalidated: Default::default(),
        applied_at: None,
        error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    store_on_finished(
        state,
        assistant_message,
        description,
        subtasks.clone(),
        needs_context_stage,
    )
    .await?;

    state.subtasks = subtasks;
    active.update(|s| s.stored_reply_ids.push(state.reply_id.clone()));
    active.finish_reply();

    spawn_summarization(state, &reply_content);

    // wait for the client to load requested context
    if !auto_load.auto_load_paths.is_empty() {
        active.stream(StreamMessage::LoadContext {
            paths: auto_load.auto_load_paths.clone(),
        });
        active.flush_stream_buffer();

        tokio::select! {
            _ = active.ctx.cancelled() => {
                return Err(AppError::Core(plandex_core::CoreError::Canceled));
            }
            _ = tokio::time::sleep(AUTO_LOAD_CONTEXT_TIMEOUT) => {
                return Err(AppError::internal("timeout waiting for auto load context response"));
            }
            _ = active.wait_auto_load_context() => {}
        }
    }

    // continuation decision
    let will_continue = will_continue_plan(
        state,
        &auto_load,
        !added_subtasks.is_empty(),
        !removed_subtasks.is_empty(),
        all_subtasks_finished,
    );

    if will_continue {
        tracing::info!(
            plan_id = %state.plan.id,
            iteration = state.iteration + 1,
            "auto-continuing plan"
        );
        super::spawn_exec_tell_plan(ExecTellParams {
            server: Arc::clone(&state.server),
            plan: state.plan.clone(),
            branch: state.branch.clone(),
            user_id: state.user_id.clone(),
            req: state.req.clone(),
            iteration: state.iteration + 1,
            missing_file_response: None,
            should_build_pending: false,
        });
        return Ok(());
    }

    let build_finished = {
        active.update(|s| s.replies_finished = true);
        active.build_finished()
    };
    tracing::info!(plan_id = %state.plan.id, build_finished, "replies finished");

    if build_finished {
        active.set_status(PlanStatus::Finished);
        state
            .server
            .registry
            .finish(&state.plan.id, &state.branch)
            .await;
    } else {
        active.set_status(PlanStatus::Building);
        active.stream(StreamMessage::RepliesFinished);
    }

    Ok(())
}

fn will_continue_plan(
    state: &TellState,
    auto_load: &AutoLoadContextResult,
    has_new_subtasks: bool,
    removed_subtasks: bool,
    all_subtasks_finished: bool,
) -> bool {
    match (
        state.current_stage.tell_stage,
        state.current_stage.planning_phase,
    ) {
        (TellStage::Planning, PlanningPhase::Context) => {
            // always continue into planning, except a chat-only turn that
            // loaded nothing
            !(state.req.is_chat_only
                && auto_load.auto_load_paths.is_empty()
                && auto_load.activated_paths.is_empty())
        }
        (TellStage::Planning, PlanningPhase::Tasks) => {
            if state.req.is_chat_only || !state.settings.auto_continue {
                return false;
            }
            // only a reply that changed the task list moves the plan forward;
            // otherwise the planner would loop without progress
            let changed_tasks = has_new_subtasks || removed_subtasks;
            changed_tasks && !all_subtasks_finished
        }
        (TellStage::Implementation, _) => {
            !all_subtasks_finished && state.iteration + 1 < MAX_AUTO_CONTINUE_ITERATIONS
        }
    }
}

/// Generate the commit message / description. Non-fatal: `None` on failure.
async fn generate_description(
    state: &TellState,
    reply_content: &str,
) -> Option<DescriptionReply> {
    if reply_content.is_empty() {
        return None;
    }
    let config = &state.settings.model_pack.describer;
    let req = ChatCompletionRequest {
        model: config.model_name.clone(),
        messages: vec![ChatMessage::system(prompts::describe_prompt(reply_content))],
        temperature: config.temperature,
        top_p: config.top_p,
        ..Default::default()
    };
    let cancel = state
        .active_plan()
        .map(|a| a.ctx.clone())
        .unwrap_or_default();

    let content = create_chat_completion_stream_with_retries(
        state.server.provider.as_ref(),
        req,
        cancel,
        1,
    )
    .await
    .ok()?
    .collect_content()
    .await
    .ok()?;

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    match serde_json::from_str::<DescriptionReply>(&content[start..=end]) {
        Ok(reply) => Some(reply),
        Err(err) => {
            tracing::warn!(error = %err, "description reply unparseable");
            None
        }
    }
}

/// Persist the reply artifacts under one write lock and commit.
async fn store_on_finished(
    state: &TellState,
    mut message: ConvoMessage,
    description: ConvoMessageDescription,
    subtasks: Vec<Subtask>,
    needs_context_stage: bool,
) -> AppResult<()> {
    let fs = state.server.plan_fs(&state.plan.org_id, &state.plan.id);
    let cancel = state
        .active_plan()
        .map(|a| a.ctx.clone())
        .unwrap_or_default();

    state
        .server
        .queue
        .exec(
            RepoOpParams {
                org_id: state.plan.org_id.clone(),
                user_id: Some(state.user_id.clone()),
                plan_id: state.plan.id.clone(),
                branch: state.branch.clone(),
                scope: LockScope::Write,
                plan_build_id: None,
                reason: "store reply".to_string(),
                cancel,
                clear_repo_on_err: true,
            },
            Box::new(move |repo| {
                if needs_context_stage {
                    // a follow-up that changes direction drops loaded context
                    // so the next iteration re-decides from the map
                    let pending_paths: HashSet<String> = fs
                        .pending_results()?
                        .into_iter()
                        .map(|r| r.path)
                        .collect();
                    for context in fs.load_context_metas()? {
                        let keep = context.context_type == ContextType::Map
                            || (!context.file_path.is_empty()
                                && pending_paths.contains(&context.file_path));
                        if !keep {
                            fs.delete_context(&context.id)?;
                        }
                    }
                }

                message.num = fs.next_message_num()?;
                fs.store_convo_message(&message)?;
                fs.store_description(&description)?;
                fs.store_subtasks(&subtasks)?;
                repo.add_and_commit(&format!(
                    "Assistant reply ({}): {}",
                    message.num, description.commit_msg
                ))?;
                Ok(())
            }),
        )
        .await
}

/// Background summarization of the conversation including the new reply.
/// Runs on the summary context so it survives stream teardown.
fn spawn_summarization(state: &TellState, reply_content: &str) {
    let Some(active) = state.active_plan() else {
        return;
    };
    let server = Arc::clone(&state.server);
    let org_id = state.plan.org_id.clone();
    let plan_id = state.plan.id.clone();
    let branch = state.branch.clone();
    let user_id = state.user_id.clone();
    let config = state.settings.model_pack.summarizer.clone();
    let summary_cancel = active.summary_ctx.clone();
    let latest_summary = state.summaries.last().cloned();
    let convo = state.convo.clone();
    let reply_id = state.reply_id.clone();
    let reply_content = reply_content.to_string();

    tokio::spawn(async move {
        // messages newer than the latest summary, plus the fresh reply
        let covered_at = latest_summary
            .as_ref()
            .map(|s| s.latest_convo_message_created_at);
        let mut new_messages: Vec<String> = convo
            .iter()
            .filter(|m| covered_at.map(|t| m.created_at > t).unwrap_or(true))
            .map(|m| format!("{}: {}", m.role, m.message))
            .collect();
        new_messages.push(format!("assistant: {}", reply_content));

        let prompt = prompts::summarize_prompt(
            latest_summary.as_ref().map(|s| s.summary.as_str()).unwrap_or(""),
            &new_messages.join("\n\n"),
        );
        let req = ChatCompletionRequest {
            model: config.model_name.clone(),
            messages: vec![ChatMessage::system(prompt)],
            temperature: config.temperature,
            top_p: config.top_p,
            ..Default::default()
        };

        let summary_text = match create_chat_completion_stream_with_retries(
            server.provider.as_ref(),
            req,
            summary_cancel.clone(),
            1,
        )
        .await
        {
            Ok(stream) => match stream.collect_content().await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(error = %err, "summarization stream failed");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "summarization request failed");
                return;
            }
        };

        let fs = server.plan_fs(&org_id, &plan_id);
        let num_messages = convo.len() + 1;
        let latest = ConvoMessage {
            id: reply_id.clone(),
            plan_id: plan_id.clone(),
            user_id: user_id.clone(),
            role: ROLE_ASSISTANT.to_string(),
            num: num_messages,
            tokens: 0,
            message: String::new(),
            stopped: false,
            flags: Default::default(),
            reply_type: Default::default(),
            subtask: None,
            added_subtasks: vec![],
            removed_subtasks: vec![],
            activated_paths: Default::default(),
            activated_paths_ordered: vec![],
            created_at: Utc::now(),
        };
        let tokens = estimate_tokens(&summary_text);
        let summary = new_summary(&plan_id, &latest, summary_text, tokens, num_messages);

        let res = server
            .queue
            .exec(
                RepoOpParams {
                    org_id,
                    user_id: Some(user_id),
                    plan_id,
                    branch,
                    scope: LockScope::Write,
                    plan_build_id: None,
                    reason: "store summary".to_string(),
                    cancel: summary_cancel,
                    clear_repo_on_err: false,
                },
                Box::new(move |_repo| fs.store_summary(&summary)),
            )
            .await;
        if let Err(err) = res {
            tracing::warn!(error = %err, "failed to store summary");
        }
    });
}

/// Best-effort persistence of a failed reply so the conversation stays
/// consistent: the partial assistant message plus an error description.
pub async fn store_error_artifacts(state: &TellState, err: &AppError) {
    let Some(active) = state.active_plan() else {
        return;
    };
    let reply_content = active.read(|s| s.current_reply_content.clone());
    if reply_content.is_empty() {
        return;
    }

    let message = ConvoMessage {
        id: state.reply_id.clone(),
        plan_id: state.plan.id.clone(),
        user_id: state.user_id.clone(),
        role: ROLE_ASSISTANT.to_string(),
        num: 0,
        tokens: estimate_tokens(&reply_content),
        message: reply_content,
        stopped: true,
        flags: ConvoMessageFlags {
            has_error: true,
            current_stage: state.current_stage,
            ..Default::default()
        },
        reply_type: Default::default(),
        subtask: None,
        added_subtasks: vec![],
        removed_subtasks: vec![],
        activated_paths: Default::default(),
        activated_paths_ordered: vec![],
        created_at: Utc::now(),
    };
    let description = ConvoMessageDescription {
        id: uuid::Uuid::new_v4().to_string(),
        plan_id: state.plan.id.clone(),
        convo_message_id: state.reply_id.clone(),
        summarized_to_message_id: String::new(),
        wrote_files: false,
        commit_msg: "Reply failed".to_string(),
        operations: vec![],
        did_build: false,
        build_paths_invalidated: Default::default(),
        applied_at: None,
        error: Some(err.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let fs = state.server.plan_fs(&state.plan.org_id, &state.plan.id);
    let res = state
        .server
        .queue
        .exec(
            RepoOpParams {
                org_id: state.plan.org_id.clone(),
                user_id: Some(state.user_id.clone()),
                plan_id: state.plan.id.clone(),
                branch: state.branch.clone(),
                scope: LockScope::Write,
                plan_build_id: None,
                reason: "store failed reply".to_string(),
                cancel: Default::default(),
                clear_repo_on_err: true,
            },
            Box::new(move |repo| {
                let mut message = message;
                message.num = fs.next_message_num()?;
                fs.store_convo_message(&message)?;
                fs.store_description(&description)?;
                repo.add_and_commit(&format!("Failed reply ({})", message.num))?;
                Ok(())
            }),
        )
        .await;
    if let Err(store_err) = res {
        tracing::warn!(error = %store_err, "failed to store error artifacts");
    }
}
