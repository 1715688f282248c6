//! Stream Listening
//!
//! Opens the model stream for one iteration and processes deltas: chunk
//! filtering, operation detection, build queueing, missing-file pausing, and
//! transient-error retries with a chunk inactivity timer.

use std::sync::Arc;
use std::time::Duration;

use plandex_core::limits::{MAX_STREAM_ERROR_RETRIES, MISSING_FILE_RESPONSE_TIMEOUT};
use plandex_core::stream::StreamMessage;
use plandex_core::{CoreError, FINISH_STOP_SEQUENCE};
use plandex_llm::{
    create_chat_completion_stream_with_retries, ChatCompletionRequest, LlmError, StreamChunk,
};

use super::{finish, prompt, ExecTellParams, TellState};
use crate::models::{BuildMode, PlanStatus};
use crate::services::active::{ActiveBuild, ActivePlan, MissingFileChoice};
use crate::services::build::BuildRunner;
use crate::utils::error::{AppError, AppResult};

enum ChunkOutcome {
    Continue,
    /// Stream handed off (missing-file recursion); stop without finishing
    Return,
    /// Terminal chunk arrived; run the finish path
    Finished,
}

/// Run one iteration end to end: open the stream, drain it, finish.
pub async fn run_iteration(state: &mut TellState) -> AppResult<()> {
    let Some(active) = state.active_plan() else {
        return Err(AppError::internal("active plan missing"));
    };

    // resuming after a missing-file pause: replay the retained reply prefix
    // through the fresh parser so it picks up where it left off
    if state.missing_file_response.is_some() {
        let retained = active.read(|s| s.current_reply_content.clone());
        if !retained.is_empty() {
            state.parser.add_chunk(&retained, true);
        }
        state.reply_num_tokens = state.parser.read().total_tokens;
    }

    prompt::assemble_messages(state)?;

    active.begin_reply(&state.reply_id);

    // resume any unbuilt operations from earlier replies
    if state.should_build_pending {
        let runner = build_runner(state);
        tokio::spawn(async move {
            if let Err(err) = runner.build_pending().await {
                tracing::warn!(error = %err, "failed to resume pending builds");
            }
        });
        state.should_build_pending = false;
    }

    let config = prompt::stage_model_config(state).clone();
    let config = config
        .for_input_tokens(state.tokens_before_convo + state.convo_token_estimate())
        .clone();

    let req = ChatCompletionRequest {
        model: config.model_name.clone(),
        messages: state.messages.clone(),
        temperature: config.temperature,
        top_p: config.top_p,
        stop: vec![FINISH_STOP_SEQUENCE.to_string()],
        include_usage: true,
        ..Default::default()
    };

    let chunk_timeout = Duration::from_secs(config.chunk_timeout_secs);
    let mut retries = 0usize;

    'stream: loop {
        let cancel = active.model_stream_ctx();
        let mut stream = create_chat_completion_stream_with_retries(
            state.server.provider.as_ref(),
            req.clone(),
            cancel.clone(),
            MAX_STREAM_ERROR_RETRIES,
        )
        .await?;

        loop {
            let next = tokio::time::timeout(chunk_timeout, stream.recv()).await;
            let chunk = match next {
                Err(_) => {
                    // no chunk within the inactivity window
                    cancel.cancel();
                    if retries < MAX_STREAM_ERROR_RETRIES && !active.ctx.is_cancelled() {
                        retries += 1;
                        tracing::warn!(retries, "chunk timeout, retrying stream");
                        active.reset_model_ctx();
                        continue 'stream;
                    }
                    return Err(AppError::Llm(LlmError::ChunkTimeout(
                        chunk_timeout.as_secs(),
                    )));
                }
                Ok(None) => {
                    if cancel.is_cancelled() {
                        // closed because the stream was paused or the plan
                        // ended; the resumed iteration owns the plan now
                        return Ok(());
                    }
                    // clean close counts as a finish
                    return finish::handle_stream_finished(state).await;
                }
                Ok(Some(Err(err))) => {
                    if active.ctx.is_cancelled() {
                        return Err(AppError::Core(CoreError::Canceled));
                    }
                    if matches!(err, LlmError::Canceled) || cancel.is_cancelled() {
                        // model stream canceled for a pause; the resumed
                        // iteration owns the plan now
                        return Ok(());
                    }
                    if err.is_retryable() && retries < MAX_STREAM_ERROR_RETRIES {
                        retries += 1;
                        tracing::warn!(retries, error = %err, "stream error, retrying");
                        continue 'stream;
                    }
                    return Err(err.into());
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            match process_chunk(state, &active, chunk).await? {
                ChunkOutcome::Continue => {}
                ChunkOutcome::Return => return Ok(()),
                ChunkOutcome::Finished => {
                    return finish::handle_stream_finished(state).await;
                }
            }
        }
    }
}

async fn process_chunk(
    state: &mut TellState,
    active: &Arc<ActivePlan>,
    chunk: StreamChunk,
) -> AppResult<ChunkOutcome> {
    if chunk.is_terminal() {
        // terminal choice or usage chunk; usage arrives after the choice
        if chunk.usage.is_some() || chunk.finish_reason.is_some() {
            return Ok(ChunkOutcome::Finished);
        }
    }

    let content = chunk.content;
    if content.is_empty() {
        return Ok(ChunkOutcome::Continue);
    }

    state.processor.chunks_received += 1;

    let reply_so_far = active.read(|s| s.current_reply_content.clone());
    state.parser.add_chunk(&content, true);
    let parser_res = state
        .processor
        .sync_file_state(&mut state.parser, &reply_so_far, &content);

    state.reply_num_tokens = parser_res.total_tokens;
    let current_file = parser_res.current_file_path.clone();

    let stream_res = state.processor.buffer_or_stream(
        &content,
        &parser_res,
        state.current_stage.tell_stage,
        &[],
    );

    // a project file that isn't in context pauses the stream for the client
    let needs_missing_file_prompt = !current_file.is_empty()
        && !state.req.is_chat_only
        && state.req.project_paths.contains(&current_file)
        && active.read(|s| {
            !s.contexts_by_path.contains_key(&current_file)
                && !s.allow_overwrite_paths.contains(&current_file)
        });

    if needs_missing_file_prompt {
        return handle_missing_file(state, active, &current_file, &stream_res.content).await;
    }

    active.update(|s| {
        s.current_reply_content.push_str(&content);
        s.num_tokens += 1;
    });

    if stream_res.should_stream {
        active.stream(StreamMessage::Reply {
            chunk: stream_res.content,
        });
    }

    // queue newly completed operations
    if !state.req.is_chat_only
        && parser_res.operations.len() > state.processor.reply_operations.len()
    {
        handle_new_operations(state, active, &parser_res.operations);
    }

    if stream_res.should_stop {
        return Ok(ChunkOutcome::Finished);
    }

    Ok(ChunkOutcome::Continue)
}

fn handle_new_operations(
    state: &mut TellState,
    active: &Arc<ActivePlan>,
    operations: &[plandex_core::Operation],
) {
    let known = state.processor.reply_operations.len();
    let mut builds = Vec::new();

    for op in &operations[known..] {
        tracing::info!(op = %op.name(), "detected operation");

        if state.req.build_mode == BuildMode::Auto {
            let content_tokens = if op.op_type == plandex_core::OperationType::File {
                plandex_llm::estimate_tokens(&op.content)
            } else {
                op.num_tokens
            };
            builds.push(ActiveBuild::from_operation(
                &state.reply_id,
                op,
                content_tokens,
            ));
        }

        state.processor.reply_operations.push(op.clone());
        let op = op.clone();
        active.update(|s| s.operations.push(op));
    }

    if !builds.is_empty() {
        build_runner(state).queue_builds(builds);
    }
}

/// Pause for a missing-file prompt: emit the control message, cancel only
/// the model stream, wait for the client's choice, then resume the same
/// iteration with the choice applied.
async fn handle_missing_file(
    state: &mut TellState,
    active: &Arc<ActivePlan>,
    current_file: &str,
    pending_chunk: &str,
) -> AppResult<ChunkOutcome> {
    tracing::info!(path = current_file, "prompting for missing file");

    active.set_status(PlanStatus::MissingFile);

    let trimmed_reply = state.parser.reply_for_missing_file();
    active.update(|s| {
        s.missing_file_path = Some(current_file.to_string());
        s.current_reply_content = trimmed_reply;
    });

    // stream what was already released for this chunk before pausing
    if !pending_chunk.is_empty() {
        let open_fence = pending_chunk
            .find("```")
            .map(|idx| {
                let rest = &pending_chunk[idx..];
                let line_end = rest.find('\n').map(|i| idx + i + 1).unwrap_or(pending_chunk.len());
                &pending_chunk[..line_end]
            })
            .unwrap_or(pending_chunk);
        active.stream(StreamMessage::Reply {
            chunk: open_fence.to_string(),
        });
        active.flush_stream_buffer();
    }

    active.stream(StreamMessage::PromptMissingFile {
        path: current_file.to_string(),
        auto_context: active.auto_context,
    });

    // stop the model stream but keep the plan alive
    active.cancel_model_stream();

    let choice = tokio::select! {
        _ = active.ctx.cancelled() => {
            return Err(AppError::Core(CoreError::Canceled));
        }
        _ = tokio::time::sleep(MISSING_FILE_RESPONSE_TIMEOUT) => {
            return Err(AppError::internal("timeout waiting for missing file choice"));
        }
        choice = active.wait_missing_file_response() => {
            choice.ok_or_else(|| AppError::internal("missing file channel closed"))?
        }
    };

    tracing::info!(path = current_file, ?choice, "missing file choice received");

    active.reset_model_ctx();
    active.set_status(PlanStatus::Replying);

    // the path stays recorded until the resumed iteration consumes it
    match choice {
        MissingFileChoice::Skip => {
            let reply_before = state.parser.reply_before_current_path();
            let num_tokens = plandex_llm::estimate_tokens(&reply_before);
            active.update(|s| {
                s.current_reply_content = reply_before;
                s.num_tokens = num_tokens;
                s.skipped_paths.insert(current_file.to_string());
            });
        }
        MissingFileChoice::Overwrite => {
            active.update(|s| {
                s.allow_overwrite_paths.insert(current_file.to_string());
            });
        }
        MissingFileChoice::Load => {}
    }

    // resume the same iteration with the choice recorded
    super::spawn_exec_tell_plan(ExecTellParams {
        server: Arc::clone(&state.server),
        plan: state.plan.clone(),
        branch: state.branch.clone(),
        user_id: state.user_id.clone(),
        req: state.req.clone(),
        iteration: state.iteration,
        missing_file_response: Some(choice),
        should_build_pending: false,
    });

    Ok(ChunkOutcome::Return)
}

fn build_runner(state: &TellState) -> Arc<BuildRunner> {
    BuildRunner::new(
        Arc::clone(&state.server),
        &state.plan.org_id,
        &state.user_id,
        &state.plan.id,
        &state.branch,
        state.settings.clone(),
    )
}

impl TellState {
    pub(super) fn convo_token_estimate(&self) -> usize {
        self.convo.iter().map(|m| m.tokens).sum()
    }
}
