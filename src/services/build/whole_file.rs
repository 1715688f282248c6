//! Whole-File Fallback
//!
//! When the validate/correct loop can't converge, ask the model for the
//! complete corrected file inside `<PlandexWholeFile>` tags. Only feasible
//! when the combined size of original and proposed content fits comfortably
//! inside the whole-file builder's reserved output budget.

use plandex_core::limits::MAX_WHOLE_FILE_RETRIES;
use plandex_core::tokens::get_xml_content;
use plandex_core::CoreError;
use plandex_llm::{estimate_tokens, retry::retry_backoff, ChatCompletionRequest, ChatMessage};

use super::line_nums::add_line_nums;
use super::FileBuildCtx;
use crate::services::prompts;
use crate::utils::error::{AppError, AppResult};

/// Feasibility gate: `proposed + original` must be under 90% of the
/// whole-file builder's reserved output tokens.
pub fn whole_file_feasible(ctx: &FileBuildCtx) -> bool {
    let reserved = ctx.settings.model_pack.whole_file_builder.reserved_output_tokens;
    let needed = estimate_tokens(&ctx.proposed) + estimate_tokens(&ctx.original);
    (needed as f64) < 0.9 * reserved as f64
}

/// Request the complete corrected file. `comments` carries the problems the
/// validation pass identified, when any.
pub async fn whole_file_fallback(ctx: &FileBuildCtx, comments: &str) -> AppResult<String> {
    if !whole_file_feasible(ctx) {
        return Err(AppError::build_failure(
            &ctx.path,
            "file too large for whole-file fallback",
        ));
    }

    let config = &ctx.settings.model_pack.whole_file_builder;

    let prompt = prompts::whole_file_prompt(
        &ctx.path,
        &add_line_nums(&ctx.original),
        &add_line_nums(&ctx.proposed),
        &ctx.desc,
        comments,
    );

    // the original is a strong prediction of the corrected output when the
    // problems are comment-level
    let prediction = if config.predicted_output_enabled && !comments.is_empty() {
        Some(format!(
            "<PlandexWholeFile>\n{}\n</PlandexWholeFile>",
            ctx.original
        ))
    } else {
        None
    };

    let req = ChatCompletionRequest {
        model: config.model_name.clone(),
        messages: vec![ChatMessage::system(prompt)],
        temperature: config.temperature,
        top_p: config.top_p,
        prediction,
        ..Default::default()
    };

    let mut retries = 0;
    loop {
        match try_whole_file(ctx, config, req.clone()).await {
            Ok(content) => return Ok(content),
            Err(err) => {
                if err.is_canceled() || retries >= MAX_WHOLE_FILE_RETRIES {
                    return Err(err);
                }
                retries += 1;
                tracing::warn!(
                    path = %ctx.path,
                    retries,
                    error = %err,
                    "whole-file build failed, retrying"
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

async fn try_whole_file(
    ctx: &FileBuildCtx,
    config: &crate::models::ModelRoleConfig,
    req: ChatCompletionRequest,
) -> AppResult<String> {
    let no_observer: Option<super::validate::OnStreamFn> = None;
    let content = super::validate::stream_completion_text(ctx, config, req, &no_observer).await?;

    let whole_file = get_xml_content(&content, "PlandexWholeFile");
    if whole_file.is_empty() {
        return Err(AppError::internal("no whole file found in response"));
    }
    Ok(whole_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanSettings;
    use crate::services::build::FileBuildCtx;
    use crate::state::ServerState;
    use crate::storage::Database;
    use crate::testing::ScriptedProvider;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx_with(
        provider: Arc<ScriptedProvider>,
        original: &str,
        proposed: &str,
        reserved: usize,
    ) -> (tempfile::TempDir, FileBuildCtx) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().unwrap();
        let server = ServerState::new(dir.path(), db, provider);

        let mut settings = PlanSettings::default();
        settings.model_pack.whole_file_builder.reserved_output_tokens = reserved;

        let ctx = FileBuildCtx {
            server,
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            plan_id: "p1".into(),
            branch: "main".into(),
            settings,
            path: "main.rs".into(),
            original: original.into(),
            proposed: proposed.into(),
            desc: "update".into(),
            build_id: "b1".into(),
            convo_message_id: "m1".into(),
            cancel: CancellationToken::new(),
        };
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_feasibility_threshold() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        // 200 + 300 token equivalents vs reserved 1000 -> feasible
        let original = "a".repeat(300 * 3 + 150);
        let proposed = "b".repeat(200 * 3 + 100);
        let (_dir, ctx) = ctx_with(provider.clone(), &original, &proposed, 1000);
        assert!(whole_file_feasible(&ctx));

        let (_dir2, ctx) = ctx_with(provider, &original, &proposed, 500);
        assert!(!whole_file_feasible(&ctx));
    }

    #[tokio::test]
    async fn test_whole_file_parses_tagged_content() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            "<PlandexWholeFile>\nfn main() { fixed(); }\n</PlandexWholeFile>".to_string(),
        ]));
        let (_dir, ctx) = ctx_with(provider, "fn main() { old(); }", "fn main() { new(); }", 10_000);

        let content = whole_file_fallback(&ctx, "bad call").await.unwrap();
        assert_eq!(content, "fn main() { fixed(); }");
    }

    #[tokio::test]
    async fn test_missing_tag_retries_then_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            "no tags here".to_string(),
            "still no tags".to_string(),
        ]));
        let (_dir, ctx) = ctx_with(provider.clone(), "orig", "prop", 10_000);

        let res = whole_file_fallback(&ctx, "").await;
        assert!(res.is_err());
        // first try + one retry
        assert_eq!(provider.num_requests(), 2);
    }
}
