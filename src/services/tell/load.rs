//! Tell Plan Loading
//!
//! Loads plan artifacts under a repo lock. The first iteration takes a write
//! lock since it also stores the user's message (and names a draft plan);
//! later iterations only need a read.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use plandex_llm::{
    create_chat_completion_stream_with_retries, estimate_tokens, ChatCompletionRequest,
    ChatMessage,
};

use super::TellState;
use crate::models::{
    Context, ConvoMessage, ConvoSummary, PlanSettings, Subtask, ROLE_USER,
};
use crate::services::prompts;
use crate::services::queue::RepoOpParams;
use crate::storage::locks::LockScope;
use crate::utils::error::AppResult;

/// Everything read from disk for one iteration.
#[derive(Default)]
struct LoadedPlan {
    settings: PlanSettings,
    contexts: Vec<Context>,
    convo: Vec<ConvoMessage>,
    summaries: Vec<ConvoSummary>,
    subtasks: Vec<Subtask>,
}

pub async fn load_tell_plan(state: &mut TellState) -> AppResult<()> {
    let is_first = state.iteration == 0 && state.missing_file_response.is_none();
    let scope = if is_first {
        LockScope::Write
    } else {
        LockScope::Read
    };

    let fs = state.server.plan_fs(&state.plan.org_id, &state.plan.id);
    let cancel = state
        .active_plan()
        .map(|a| a.ctx.clone())
        .unwrap_or_default();

    let loaded = Arc::new(Mutex::new(LoadedPlan::default()));
    let loaded_in = Arc::clone(&loaded);
    let stored_prompt_id = Arc::new(Mutex::new(None::<String>));
    let stored_prompt_id_in = Arc::clone(&stored_prompt_id);
    let store_user_message = is_first && !state.req.is_user_continue;
    let prompt = state.req.prompt.clone();
    let plan_id = state.plan.id.clone();
    let user_id = state.user_id.clone();
    let fs_in = fs.clone();

    state
        .server
        .queue
        .exec(
            RepoOpParams {
                org_id: state.plan.org_id.clone(),
                user_id: Some(state.user_id.clone()),
                plan_id: state.plan.id.clone(),
                branch: state.branch.clone(),
                scope,
                plan_build_id: None,
                reason: "load tell plan".to_string(),
                cancel,
                clear_repo_on_err: true,
            },
            Box::new(move |repo| {
                if store_user_message {
                    let num = fs_in.next_message_num()?;
                    let message = ConvoMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        plan_id,
                        user_id,
                        role: ROLE_USER.to_string(),
                        num,
                        tokens: estimate_tokens(&prompt),
                        message: prompt,
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
                    fs_in.store_convo_message(&message)?;
                    *stored_prompt_id_in.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(message.id.clone());
                    repo.add_and_commit(&format!("User prompt ({})", num))?;
                }

                let mut loaded = loaded_in.lock().unwrap_or_else(|e| e.into_inner());
                loaded.settings = fs_in.load_settings()?;
                loaded.contexts = fs_in.load_contexts()?;
                loaded.convo = fs_in.load_conversation()?;
                loaded.summaries = fs_in.load_summaries()?;
                loaded.subtasks = fs_in.load_subtasks()?;
                Ok(())
            }),
        )
        .await?;

    let loaded = Arc::try_unwrap(loaded)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_default();
    state.prompt_message_id = stored_prompt_id
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    state.settings = loaded.settings;
    state.contexts = loaded.contexts.into_iter().map(Arc::new).collect();
    state.convo = loaded.convo;
    state.summaries = loaded.summaries;
    state.subtasks = loaded.subtasks;

    state.has_context_map = state.contexts.iter().any(|c| c.is_map());
    state.context_map_empty = state
        .contexts
        .iter()
        .filter(|c| c.is_map())
        .all(|c| c.map_is_empty());

    state.user_prompt = state
        .convo
        .iter()
        .rev()
        .find(|m| m.role == ROLE_USER)
        .map(|m| m.message.clone())
        .unwrap_or_else(|| state.req.prompt.clone());

    if state.plan.is_draft() && !state.req.prompt.is_empty() {
        name_draft_plan(state).await;
    }

    Ok(())
}

/// Push loaded contexts (and skipped-path cleanup) into the active plan.
pub fn sync_active_plan(state: &mut TellState) {
    let Some(active) = state.active_plan() else {
        return;
    };
    let is_first = state.iteration == 0 && state.missing_file_response.is_none();

    if is_first {
        let contexts = state.contexts.clone();
        active.update(|s| {
            s.contexts = contexts.clone();
            for context in &contexts {
                if !context.file_path.is_empty() {
                    s.contexts_by_path
                        .insert(context.file_path.clone(), Arc::clone(context));
                }
            }
        });
    } else if state.missing_file_response.is_none() {
        // fresh reply for this iteration
        active.update(|s| {
            s.current_reply_content.clear();
            s.num_tokens = 0;
        });
    }

    // paths skipped earlier that have since been added to context are no
    // longer skipped
    active.update(|s| {
        let to_unskip: Vec<String> = s
            .skipped_paths
            .iter()
            .filter(|p| s.contexts_by_path.contains_key(*p))
            .cloned()
            .collect();
        for path in to_unskip {
            s.skipped_paths.remove(&path);
        }
    });
}

/// Name a draft plan with the namer model. Best effort: failures keep the
/// draft name.
async fn name_draft_plan(state: &mut TellState) {
    let config = &state.settings.model_pack.namer;
    let req = ChatCompletionRequest {
        model: config.model_name.clone(),
        messages: vec![ChatMessage::system(prompts::plan_name_prompt(
            &state.req.prompt,
        ))],
        temperature: config.temperature,
        top_p: config.top_p,
        ..Default::default()
    };
    let cancel = state
        .active_plan()
        .map(|a| a.ctx.clone())
        .unwrap_or_default();

    match create_chat_completion_stream_with_retries(
        state.server.provider.as_ref(),
        req,
        cancel,
        1,
    )
    .await
    {
        Ok(stream) => match stream.collect_content().await {
            Ok(name) => {
                let name = name.trim().trim_matches('"').to_string();
                if !name.is_empty() {
                    tracing::info!(plan_id = %state.plan.id, name, "named draft plan");
                    state.plan.name = name;
                }
            }
            Err(err) => tracing::warn!(error = %err, "draft naming stream failed"),
        },
        Err(err) => tracing::warn!(error = %err, "draft naming request failed"),
    }
}
