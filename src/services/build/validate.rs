//! Validate / Correct Loop
//!
//! Asks the builder model to verify a proposed file update. The model either
//! confirms with `<PlandexCorrect/>` or supplies `<PlandexReplacements>`
//! whose `<Old>` blocks quote pdx-numbered lines of the original; the
//! replacements are applied against the numbered original and the result is
//! re-validated. Up to `MAX_VALIDATION_FIX_ATTEMPTS` rounds, switching to
//! the configured strong model after the second attempt.

use std::sync::Arc;
use std::time::Duration;

use plandex_core::limits::{MAX_BUILD_ERROR_RETRIES, MAX_VALIDATION_FIX_ATTEMPTS};
use plandex_core::tokens::{get_all_xml_content, get_xml_content};
use plandex_core::{CORRECT_TAG, FINISH_STOP_SEQUENCE, INCORRECT_TAG};
use plandex_llm::{retry::retry_backoff, ChatCompletionRequest, ChatMessage, LlmError};

use super::line_nums::{add_line_nums, extract_line_number, remove_line_nums};
use super::{diff, FileBuildCtx};
use crate::models::ModelRoleConfig;
use crate::services::prompts;
use crate::utils::error::{AppError, AppResult};
use plandex_core::CoreError;

/// Callback observed on each streamed chunk of the first attempt: the race
/// watches the accumulated buffer for the incorrect marker.
pub type OnStreamFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ValidateLoopResult {
    pub valid: bool,
    pub updated: String,
    pub problem: String,
    pub syntax_errors: Vec<String>,
}

/// Run the validate/correct loop against the builder model.
pub async fn validate_loop(
    ctx: &FileBuildCtx,
    initial_syntax_errors: Vec<String>,
    on_initial_stream: Option<OnStreamFn>,
) -> AppResult<ValidateLoopResult> {
    let mut updated = ctx.proposed.clone();
    let mut syntax_errors = initial_syntax_errors;
    let mut problems: Vec<String> = Vec::new();

    for attempt in 0..MAX_VALIDATION_FIX_ATTEMPTS {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Core(CoreError::Canceled));
        }

        let mut config = &ctx.settings.model_pack.builder;
        if attempt + 1 > 2 {
            if let Some(strong) = &ctx.settings.model_pack.builder.strong_model {
                tracing::debug!(path = %ctx.path, attempt, "switching to strong model");
                config = strong.as_ref();
            }
        }

        let on_stream = if attempt == 0 {
            on_initial_stream.clone()
        } else {
            None
        };

        let res = build_validate(ctx, config, &updated, &syntax_errors, &problems, on_stream)
            .await?;
        updated = res.updated;

        syntax_errors = ctx.validate_syntax(&updated).await;

        if res.valid && syntax_errors.is_empty() {
            tracing::debug!(path = %ctx.path, attempt, "validation succeeded");
            return Ok(ValidateLoopResult {
                valid: true,
                updated,
                problem: String::new(),
                syntax_errors,
            });
        }

        if !res.problem.is_empty() {
            problems.push(res.problem);
        }
        tracing::debug!(path = %ctx.path, attempt, "validation attempt failed");
    }

    Ok(ValidateLoopResult {
        valid: false,
        updated,
        problem: problems.join("\n\n"),
        syntax_errors,
    })
}

struct ValidateResult {
    valid: bool,
    updated: String,
    problem: String,
}

/// One validation round: model call (with transient-error retries) and
/// replacement handling.
async fn build_validate(
    ctx: &FileBuildCtx,
    config: &ModelRoleConfig,
    updated: &str,
    syntax_errors: &[String],
    problems: &[String],
    on_stream: Option<OnStreamFn>,
) -> AppResult<ValidateResult> {
    let original_numbered = add_line_nums(&ctx.original);
    let proposed_numbered = add_line_nums(&ctx.proposed);
    let diff_text = diff::unified_diff(&ctx.original, updated);

    let prompt = prompts::validation_replacements_prompt(
        &ctx.path,
        &original_numbered,
        &proposed_numbered,
        &ctx.desc,
        &diff_text,
        syntax_errors,
        problems,
    );

    let req = ChatCompletionRequest {
        model: config.model_name.clone(),
        messages: vec![ChatMessage::system(prompt)],
        temperature: config.temperature,
        top_p: config.top_p,
        stop: vec![FINISH_STOP_SEQUENCE.to_string()],
        ..Default::default()
    };

    let mut retries = 0;
    loop {
        match try_validate_once(ctx, config, req.clone(), &original_numbered, updated, &on_stream)
            .await
        {
            Ok(res) => return Ok(res),
            Err(err) => {
                if err.is_canceled() || retries >= MAX_BUILD_ERROR_RETRIES {
                    return Err(err);
                }
                retries += 1;
                tracing::warn!(
                    path = %ctx.path,
                    retries,
                    error = %err,
                    "validation round failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_backoff(retries)) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(AppError::Core(CoreError::Canceled));
                    }
                }
            }
        }
    }
}

async fn try_validate_once(
    ctx: &FileBuildCtx,
    config: &ModelRoleConfig,
    req: ChatCompletionRequest,
    original_numbered: &str,
    updated: &str,
    on_stream: &Option<OnStreamFn>,
) -> AppResult<ValidateResult> {
    let content = stream_completion_text(ctx, config, req, on_stream).await?;
    handle_xml_response(&content, original_numbered, updated)
}

/// Stream a completion to text, enforcing the chunk inactivity timeout and
/// invoking the optional per-chunk observer.
pub(super) async fn stream_completion_text(
    ctx: &FileBuildCtx,
    config: &ModelRoleConfig,
    req: ChatCompletionRequest,
    on_stream: &Option<OnStreamFn>,
) -> AppResult<String> {
    let cancel = ctx.cancel.child_token();
    let mut stream = ctx
        .server
        .provider
        .create_chat_completion_stream(req, cancel.clone())
        .await?;

    let chunk_timeout = Duration::from_secs(config.chunk_timeout_secs);
    let mut buffer = String::new();

    loop {
        let next = tokio::time::timeout(chunk_timeout, stream.recv()).await;
        match next {
            Err(_) => {
                cancel.cancel();
                return Err(AppError::Llm(LlmError::ChunkTimeout(
                    chunk_timeout.as_secs(),
                )));
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(chunk))) => {
                if !chunk.content.is_empty() {
                    buffer.push_str(&chunk.content);
                    if let Some(on_stream) = on_stream {
                        on_stream(&chunk.content, &buffer);
                    }
                }
                if chunk.is_terminal() && chunk.usage.is_some() {
                    break;
                }
            }
        }
    }

    if buffer.is_empty() {
        return Err(AppError::Llm(LlmError::NoChoices));
    }
    Ok(buffer)
}

/// Interpret the model's verdict and apply any replacements against the
/// numbered original.
fn handle_xml_response(
    content: &str,
    original_numbered: &str,
    updated: &str,
) -> AppResult<ValidateResult> {
    if content.contains(CORRECT_TAG) {
        return Ok(ValidateResult {
            valid: true,
            updated: updated.to_string(),
            problem: String::new(),
        });
    }

    let original_lines: Vec<&str> = original_numbered.split('\n').collect();
    let mut incremental = original_numbered.to_string();

    let replacements_outer = get_xml_content(content, "PlandexReplacements");
    if replacements_outer.is_empty() {
        return Ok(ValidateResult {
            valid: false,
            updated: remove_line_nums(&incremental),
            problem: "No replacements found in response".to_string(),
        });
    }

    for replacement in get_all_xml_content(&replacements_outer, "Replacement") {
        let old = get_xml_content(&replacement, "Old");
        let new = get_xml_content(&replacement, "New");
        if old.is_empty() {
            return Err(AppError::internal("replacement has no old content"));
        }

        let old = old.trim();
        if !old.starts_with("pdx-") {
            return Err(AppError::internal(
                "old content missing line number prefix on first line",
            ));
        }

        let old_lines: Vec<&str> = old.split('\n').collect();
        let first_line_num = extract_line_number(old_lines[0])
            .ok_or_else(|| AppError::internal("bad line number on first line"))?;
        let last_line_num = if old_lines.len() > 1 {
            Some(
                extract_line_number(old_lines[old_lines.len() - 1])
                    .ok_or_else(|| AppError::internal("bad line number on last line"))?,
            )
        } else {
            None
        };

        let resolved_old = match last_line_num {
            None => {
                if !(first_line_num >= 1 && first_line_num <= original_lines.len()) {
                    return Err(AppError::internal(format!(
                        "invalid line number: {}",
                        first_line_num
                    )));
                }
                original_lines[first_line_num - 1].to_string()
            }
            Some(last) => {
                if !(first_line_num >= 1
                    && first_line_num <= original_lines.len()
                    && last > first_line_num
                    && last <= original_lines.len())
                {
                    return Err(AppError::internal(format!(
                        "invalid line numbers: {}-{}",
                        first_line_num, last
                    )));
                }
                original_lines[first_line_num - 1..last].join("\n")
            }
        };

        incremental = incremental.replacen(&resolved_old, &new, 1);
    }

    let problem = if let Some(idx) = content.find(INCORRECT_TAG) {
        content[..idx].trim().to_string()
    } else if let Some(idx) = content.find("<PlandexReplacements>") {
        content[..idx].trim().to_string()
    } else {
        String::new()
    };

    Ok(ValidateResult {
        valid: false,
        updated: remove_line_nums(&incremental),
        problem,
    })
}
