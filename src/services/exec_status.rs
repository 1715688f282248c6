//! Exec-Status Classifier
//!
//! Decides whether the current subtask is finished after an implementation
//! reply. Cheap checks run first: the completion marker in the reply, a
//! cross-check that the reply actually wrote the files the subtask uses, and
//! a cap on attempts per subtask. Only ambiguous cases reach the model.
//!
//! Classifier failures are never fatal; the plan continues with the safe
//! default of not marking the subtask finished.

use std::sync::Arc;

use plandex_core::{Operation, OperationType};
use plandex_llm::{
    create_chat_completion_stream_with_retries, ChatCompletionRequest, ChatMessage, ModelProvider,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::models::{ConvoMessage, ModelRoleConfig, Subtask};
use crate::services::prompts;

/// Give up on a subtask after this many messages have tried it; prevents
/// infinite implementation loops.
pub const MAX_PREVIOUS_MESSAGES: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatusResult {
    pub subtask_finished: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifierReply {
    subtask_finished: bool,
}

pub struct ExecStatusParams<'a> {
    pub provider: Arc<dyn ModelProvider>,
    pub config: &'a ModelRoleConfig,
    pub user_prompt: &'a str,
    pub current_subtask: Option<&'a Subtask>,
    pub convo: &'a [ConvoMessage],
    pub reply_operations: &'a [Operation],
    pub current_message: &'a str,
    pub cancel: CancellationToken,
}

/// Classify whether the current subtask is finished.
pub async fn exec_status_should_continue(params: ExecStatusParams<'_>) -> ExecStatusResult {
    let Some(subtask) = params.current_subtask else {
        // nothing to finish; treat the turn as complete
        return ExecStatusResult {
            subtask_finished: true,
        };
    };

    let marker = prompts::subtask_completion_marker(&subtask.title);

    if params.current_message.contains(&marker) {
        let potential_problem = has_potential_problem(subtask, params.reply_operations);

        if !potential_problem {
            tracing::debug!(subtask = %subtask.title, "completion marker found, marking finished");
            return ExecStatusResult {
                subtask_finished: true,
            };
        }
        if subtask.num_tries >= 1 {
            // questionable, but a second try: accept rather than risk a loop
            tracing::debug!(subtask = %subtask.title, "questionable completion accepted on retry");
            return ExecStatusResult {
                subtask_finished: true,
            };
        }
        tracing::debug!(subtask = %subtask.title, "questionable completion, asking the model");
    }

    let previous_messages: Vec<String> = params
        .convo
        .iter()
        .filter(|m| {
            m.subtask
                .as_ref()
                .map(|t| t.title == subtask.title)
                .unwrap_or(false)
        })
        .map(|m| m.message.clone())
        .collect();

    if previous_messages.len() >= MAX_PREVIOUS_MESSAGES {
        tracing::warn!(
            subtask = %subtask.title,
            attempts = previous_messages.len(),
            "max attempts reached, marking subtask finished"
        );
        return ExecStatusResult {
            subtask_finished: true,
        };
    }

    let full_subtask = format!("{}\n\n{}", subtask.title, subtask.description);
    let prompt = prompts::exec_status_prompt(
        params.user_prompt,
        &full_subtask,
        params.current_message,
        &previous_messages,
    );

    let req = ChatCompletionRequest {
        model: params.config.model_name.clone(),
        messages: vec![ChatMessage::system(prompt)],
        temperature: params.config.temperature,
        top_p: params.config.top_p,
        ..Default::default()
    };

    let content = match create_chat_completion_stream_with_retries(
        params.provider.as_ref(),
        req,
        params.cancel,
        1,
    )
    .await
    {
        Ok(stream) => match stream.collect_content().await {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(error = %err, "exec-status stream failed, using safe default");
                return ExecStatusResult::default();
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "exec-status request failed, using safe default");
            return ExecStatusResult::default();
        }
    };

    match parse_classifier_reply(&content) {
        Some(reply) => ExecStatusResult {
            subtask_finished: reply.subtask_finished,
        },
        None => {
            tracing::warn!("exec-status reply unparseable, using safe default");
            ExecStatusResult::default()
        }
    }
}

/// The marker alone isn't trusted when the reply wrote nothing, or skipped
/// files the subtask says it uses.
fn has_potential_problem(subtask: &Subtask, operations: &[Operation]) -> bool {
    if operations.is_empty() {
        return true;
    }
    let wrote: std::collections::HashSet<&str> = operations
        .iter()
        .filter(|op| op.op_type == OperationType::File)
        .map(|op| op.path.as_str())
        .collect();
    subtask
        .uses_files
        .iter()
        .any(|path| !wrote.contains(path.as_str()))
}

fn parse_classifier_reply(content: &str) -> Option<ClassifierReply> {
    // the model may wrap the JSON in prose or a code fence
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    serde_json::from_str(&content[start..=end]).ok()
}
