//! Build Race
//!
//! Runs the validate/correct loop and, when the model signals
//! `<PlandexIncorrect/>` with `<PlandexComments>` during the initial stream,
//! starts a whole-file build concurrently. The first successful result wins
//! and the loser is canceled. If the validation loop fails without ever
//! signalling, the whole-file fallback still runs once as a last resort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plandex_core::tokens::get_xml_content;
use plandex_core::{CoreError, INCORRECT_TAG};
use tokio::sync::mpsc;

use super::validate::{validate_loop, OnStreamFn};
use super::whole_file::whole_file_fallback;
use super::FileBuildCtx;
use crate::utils::error::{AppError, AppResult};

const MAX_RACE_ERRORS: usize = 2;

/// Race the validation loop against the whole-file fallback.
pub async fn build_race(
    ctx: &FileBuildCtx,
    initial_syntax_errors: Vec<String>,
) -> AppResult<String> {
    let race_cancel = ctx.cancel.child_token();
    let race_ctx = Arc::new(FileBuildCtx {
        cancel: race_cancel.clone(),
        ..ctx.clone()
    });

    let (res_tx, mut res_rx) = mpsc::channel::<String>(1);
    let (err_tx, mut err_rx) = mpsc::channel::<AppError>(MAX_RACE_ERRORS);
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<String>(1);

    // watch the initial validation stream for the incorrect marker
    let triggered = Arc::new(AtomicBool::new(false));
    let on_stream: OnStreamFn = {
        let trigger_tx = trigger_tx.clone();
        let triggered = Arc::clone(&triggered);
        Arc::new(move |_chunk: &str, buffer: &str| {
            if triggered.load(Ordering::SeqCst) {
                return;
            }
            if buffer.contains(INCORRECT_TAG) && buffer.contains("<PlandexComments>") {
                let comments = get_xml_content(buffer, "PlandexComments");
                if !comments.is_empty() && !triggered.swap(true, Ordering::SeqCst) {
                    tracing::debug!("incorrect marker detected, triggering whole-file build");
                    let _ = trigger_tx.try_send(comments);
                }
            }
        })
    };

    // validation loop task
    {
        let ctx = Arc::clone(&race_ctx);
        let res_tx = res_tx.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            match validate_loop(&ctx, initial_syntax_errors, Some(on_stream)).await {
                Ok(res) if res.valid => {
                    let _ = res_tx.send(res.updated).await;
                }
                Ok(res) => {
                    let _ = err_tx
                        .send(AppError::build_failure(
                            &ctx.path,
                            format!("validation loop failed: {}", res.problem),
                        ))
                        .await;
                }
                Err(err) => {
                    if !err.is_canceled() {
                        let _ = err_tx.send(err).await;
                    }
                }
            }
        });
    }

    let mut started_fallback = false;
    let mut errors: Vec<String> = Vec::new();

    let start_fallback = |comments: String,
                          res_tx: mpsc::Sender<String>,
                          err_tx: mpsc::Sender<AppError>| {
        let ctx = Arc::clone(&race_ctx);
        tokio::spawn(async move {
            match whole_file_fallback(&ctx, &comments).await {
                Ok(content) => {
                    let _ = res_tx.send(content).await;
                }
                Err(err) => {
                    if !err.is_canceled() {
                        let _ = err_tx.send(err).await;
                    }
                }
            }
        });
    };

    loop {
        tokio::select! {
            res = res_rx.recv() => {
                race_cancel.cancel();
                return res.ok_or_else(|| AppError::internal("race result channel closed"));
            }
            comments = trigger_rx.recv(), if !started_fallback => {
                if let Some(comments) = comments {
                    started_fallback = true;
                    start_fallback(comments, res_tx.clone(), err_tx.clone());
                }
            }
            err = err_rx.recv() => {
                let Some(err) = err else {
                    return Err(AppError::internal("race error channel closed"));
                };
                errors.push(err.to_string());
                if errors.len() >= MAX_RACE_ERRORS {
                    race_cancel.cancel();
                    return Err(AppError::build_failure(
                        &ctx.path,
                        format!("all build attempts failed: {}", errors.join("; ")),
                    ));
                }
                if !started_fallback {
                    started_fallback = true;
                    start_fallback(String::new(), res_tx.clone(), err_tx.clone());
                }
            }
            _ = ctx.cancel.cancelled() => {
                race_cancel.cancel();
                return Err(AppError::Core(CoreError::Canceled));
            }
        }
    }
}
