//! Prompt Resolution & Token Budget
//!
//! Assembles the request messages for one iteration: system message with
//! formatted context, the summarized-or-full conversation, and the resolved
//! prompt message. Enforces the planner's token budget before any request
//! goes out.

use plandex_core::CoreError;
use plandex_llm::{estimate_tokens, ChatMessage};

use super::TellState;
use crate::models::{ModelRoleConfig, PlanningPhase, TellStage, ROLE_USER};
use crate::services::active::MissingFileChoice;
use crate::services::context::{format_model_context, plan_conversation, ContextFormatParams};
use crate::services::prompts;
use crate::utils::error::{AppError, AppResult};

/// Model role for the current stage.
pub fn stage_model_config(state: &TellState) -> &ModelRoleConfig {
    match (
        state.current_stage.tell_stage,
        state.current_stage.planning_phase,
    ) {
        (TellStage::Planning, PlanningPhase::Context) => &state.settings.model_pack.context_loader,
        (TellStage::Planning, PlanningPhase::Tasks) => &state.settings.model_pack.planner,
        (TellStage::Implementation, _) => &state.settings.model_pack.coder,
    }
}

/// Build `state.messages` for this iteration. Fails with a token-limit error
/// when the fixed parts alone exceed the stage budget, or when no summary
/// substitution can fit the conversation.
pub fn assemble_messages(state: &mut TellState) -> AppResult<()> {
    let active = state.active_plan();
    let skipped_paths = active
        .as_ref()
        .map(|a| a.read(|s| s.skipped_paths.clone()))
        .unwrap_or_default();

    let current_subtask = state.current_subtask().cloned();
    let formatted = format_model_context(ContextFormatParams {
        contexts: &state.contexts,
        stage: state.current_stage,
        auto_context: state.req.auto_context,
        activated_paths: &state.activated_paths,
        current_subtask: current_subtask.as_ref(),
        skipped_paths: &skipped_paths,
    });

    let mut system_text = format!(
        "You are a careful coding assistant working on a plan.{}",
        formatted.text
    );
    if state.current_stage.tell_stage == TellStage::Implementation {
        system_text.push_str(&prompts::subtasks_prompt(
            &state.subtasks,
            current_subtask.as_ref(),
        ));
    }

    // resolve the prompt message before budgeting so its tokens count
    let prompt_message = resolve_prompt_message(state)?;
    let prompt_tokens = prompt_message
        .as_ref()
        .map(|m| estimate_tokens(&m.content))
        .unwrap_or(0);

    let config = stage_model_config(state).clone();
    let system_tokens = estimate_tokens(&system_text);
    state.tokens_before_convo =
        system_tokens + prompt_tokens + plandex_llm::tokens::TOKENS_PER_REQUEST;

    if state.tokens_before_convo > config.effective_max_tokens() {
        return Err(AppError::Core(CoreError::token_limit(format!(
            "token limit exceeded before adding conversation ({} > {})",
            state.tokens_before_convo,
            config.effective_max_tokens()
        ))));
    }

    let convo_plan = plan_conversation(
        &state.convo,
        &state.summaries,
        state.tokens_before_convo,
        &config,
        state.prompt_message_id.as_deref(),
    )?;
    state.summarized_to_message_id = convo_plan
        .summary
        .as_ref()
        .map(|s| s.latest_convo_message_id.clone());

    let mut messages = vec![ChatMessage::system(system_text)];
    messages.extend(convo_plan.messages);

    match state.missing_file_response {
        None => {
            if let Some(prompt_message) = prompt_message {
                // a continue-from-user-message reuses the stored prompt,
                // which is already the last conversation message
                if state.req.is_user_continue
                    && messages
                        .last()
                        .map(|m| m.role == plandex_llm::Role::User)
                        .unwrap_or(false)
                {
                    messages.pop();
                }
                messages.push(prompt_message);
            }
        }
        Some(choice) => {
            // resume after a missing-file pause: replay the retained reply
            // prefix and tell the model how to proceed
            let current_reply = state
                .active_plan()
                .map(|a| a.read(|s| s.current_reply_content.clone()))
                .unwrap_or_default();
            messages.push(ChatMessage::assistant(current_reply));
            let missing_path = state
                .active_plan()
                .and_then(|a| a.update(|s| s.missing_file_path.take()))
                .unwrap_or_default();
            let user_msg = match choice {
                MissingFileChoice::Skip => prompts::skip_missing_file_prompt(&missing_path),
                _ => prompts::MISSING_FILE_CONTINUE_PROMPT.to_string(),
            };
            messages.push(ChatMessage::user(user_msg));
        }
    }

    state.messages = messages;
    Ok(())
}

/// Resolve the user prompt message for a normal (non-resume) iteration.
fn resolve_prompt_message(state: &TellState) -> AppResult<Option<ChatMessage>> {
    if state.missing_file_response.is_some() {
        return Ok(None);
    }

    if state.req.is_user_continue {
        if state.convo.is_empty() {
            return Err(AppError::user_input("No messages yet. Can't continue plan."));
        }
        let last = &state.convo[state.convo.len() - 1];
        let content = if last.role == ROLE_USER {
            prompts::wrapped_prompt(&last.message)
        } else {
            prompts::wrapped_prompt(prompts::USER_CONTINUE_PROMPT)
        };
        return Ok(Some(ChatMessage::user(content)));
    }

    let prompt = if state.iteration == 0 {
        let mut prompt = state.req.prompt.clone();
        if state.req.is_apply_debug {
            prompt.push_str(prompts::APPLY_DEBUG_PROMPT_SUFFIX);
        } else if state.req.is_debug {
            prompt.push_str(prompts::DEBUG_PROMPT_SUFFIX);
        }
        // follow-ups on an existing conversation get the classifier preamble
        if state.convo.iter().filter(|m| m.role == ROLE_USER).count() > 1 {
            prompt = format!("{}\n\n{}", prompts::FOLLOW_UP_CLASSIFIER_PREAMBLE, prompt);
        }
        prompt
    } else {
        prompts::AUTO_CONTINUE_PROMPT.to_string()
    };

    Ok(Some(ChatMessage::user(prompts::wrapped_prompt(&prompt))))
}
