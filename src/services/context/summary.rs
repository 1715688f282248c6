//! Summary Manager
//!
//! Rolling conversation summaries keep long plans inside the planner's token
//! budget. Summaries are strictly ordered by the timestamp of the last
//! message they cover; substituting one replaces the contiguous prefix of the
//! conversation it summarizes.

use chrono::Utc;
use plandex_core::CoreError;
use plandex_llm::{ChatMessage, Role};

use crate::models::{ConvoMessage, ConvoSummary, ModelRoleConfig, ROLE_ASSISTANT};
use crate::utils::error::{AppError, AppResult};

/// The conversation as it will be sent: an optional summary standing in for
/// a prefix, followed by the remaining messages verbatim.
#[derive(Debug, Clone)]
pub struct ConvoPlan {
    pub summary: Option<ConvoSummary>,
    pub messages: Vec<ChatMessage>,
    pub convo_tokens: usize,
    pub num_messages_summarized: usize,
}

/// Pick the conversation representation that fits the planner's budget.
///
/// If the full conversation fits both the request budget and the standalone
/// conversation cap, it is used as-is. Otherwise summaries are walked oldest
/// to newest and the first one whose substitution brings both quantities
/// under their limits wins. If none suffices, the token-limit error is
/// surfaced.
///
/// `skip_message_id` excludes the just-stored prompt message: the wrapped
/// prompt is appended to the request separately and already counted in
/// `tokens_before_convo`.
pub fn plan_conversation(
    convo: &[ConvoMessage],
    summaries: &[ConvoSummary],
    tokens_before_convo: usize,
    planner: &ModelRoleConfig,
    skip_message_id: Option<&str>,
) -> AppResult<ConvoPlan> {
    let effective_max = planner.effective_max_tokens();
    let max_convo = planner.max_convo_tokens;

    let included = |m: &&ConvoMessage| skip_message_id != Some(m.id.as_str());

    let fits = |convo_tokens: usize| {
        tokens_before_convo + convo_tokens <= effective_max
            && (max_convo == 0 || convo_tokens <= max_convo)
    };

    let full_tokens: usize = convo.iter().filter(included).map(|m| m.tokens).sum();
    if fits(full_tokens) {
        return Ok(ConvoPlan {
            summary: None,
            messages: convo.iter().filter(included).map(to_chat_message).collect(),
            convo_tokens: full_tokens,
            num_messages_summarized: 0,
        });
    }

    for summary in summaries {
        let Some(covered_idx) = convo
            .iter()
            .position(|m| m.id == summary.latest_convo_message_id)
        else {
            continue;
        };
        let remaining = &convo[covered_idx + 1..];
        let remaining_tokens: usize = remaining
            .iter()
            .filter(included)
            .map(|m| m.tokens)
            .sum();
        let candidate_tokens = summary.tokens + remaining_tokens;

        if fits(candidate_tokens) {
            let mut messages = vec![ChatMessage::assistant(format!(
                "Summary of the conversation so far:\n\n{}",
                summary.summary
            ))];
            messages.extend(remaining.iter().filter(included).map(to_chat_message));
            return Ok(ConvoPlan {
                summary: Some(summary.clone()),
                messages,
                convo_tokens: candidate_tokens,
                num_messages_summarized: covered_idx + 1,
            });
        }
    }

    Err(AppError::Core(CoreError::token_limit(
        "couldn't get under token limit with conversation summary",
    )))
}

fn to_chat_message(msg: &ConvoMessage) -> ChatMessage {
    let role = if msg.role == ROLE_ASSISTANT {
        Role::Assistant
    } else {
        Role::User
    };
    ChatMessage {
        role,
        content: msg.message.clone(),
    }
}

/// Build the summary record covering the conversation through `latest`.
pub fn new_summary(
    plan_id: &str,
    latest: &ConvoMessage,
    summary_text: String,
    tokens: usize,
    num_messages: usize,
) -> ConvoSummary {
    ConvoSummary {
        id: uuid::Uuid::new_v4().to_string(),
        plan_id: plan_id.to_string(),
        latest_convo_message_id: latest.id.clone(),
        latest_convo_message_created_at: latest.created_at,
        summary: summary_text,
        tokens,
        num_messages,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: &str, num: usize, tokens: usize) -> ConvoMessage {
        ConvoMessage {
            id: id.into(),
            plan_id: "p1".into(),
            user_id: "u1".into(),
            role: if num % 2 == 1 { "user" } else { "assistant" }.into(),
            num,
            tokens,
            message: format!("message {}", num),
            stopped: false,
            flags: Default::default(),
            reply_type: Default::default(),
            subtask: None,
            added_subtasks: vec![],
            removed_subtasks: vec![],
            activated_paths: Default::default(),
            activated_paths_ordered: vec![],
            created_at: Utc::now(),
        }
    }

    fn summary(covering: &str, tokens: usize, offset_secs: i64) -> ConvoSummary {
        ConvoSummary {
            id: format!("sum-{}", covering),
            plan_id: "p1".into(),
            latest_convo_message_id: covering.into(),
            latest_convo_message_created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
            summary: format!("summary through {}", covering),
            tokens,
            num_messages: 2,
            created_at: Utc::now(),
        }
    }

    fn planner(max_input: usize, max_convo: usize) -> ModelRoleConfig {
        let mut cfg = ModelRoleConfig::new("planner");
        cfg.max_input_tokens = max_input;
        cfg.reserved_output_tokens = 0;
        cfg.max_convo_tokens = max_convo;
        cfg
    }

    #[test]
    fn test_full_conversation_fits() {
        let convo = vec![msg("m1", 1, 100), msg("m2", 2, 100)];
        let plan = plan_conversation(&convo, &[], 500, &planner(10_000, 1_000), None).unwrap();
        assert!(plan.summary.is_none());
        assert_eq!(plan.messages.len(), 2);
        assert_eq!(plan.convo_tokens, 200);
    }

    #[test]
    fn test_first_sufficient_summary_wins() {
        let convo = vec![
            msg("m1", 1, 5_000),
            msg("m2", 2, 5_000),
            msg("m3", 3, 100),
            msg("m4", 4, 100),
        ];
        // oldest summary covers m1..m2; its substitution already fits
        let summaries = vec![summary("m2", 300, 1), summary("m3", 200, 2)];
        let plan = plan_conversation(&convo, &summaries, 100, &planner(10_000, 2_000), None).unwrap();
        let chosen = plan.summary.unwrap();
        assert_eq!(chosen.latest_convo_message_id, "m2");
        // summary message + m3 + m4
        assert_eq!(plan.messages.len(), 3);
        assert_eq!(plan.convo_tokens, 300 + 200);
        assert_eq!(plan.num_messages_summarized, 2);
    }

    #[test]
    fn test_no_summary_suffices() {
        let convo = vec![msg("m1", 1, 50_000), msg("m2", 2, 50_000)];
        let summaries = vec![summary("m1", 40_000, 1)];
        let err = plan_conversation(&convo, &summaries, 100, &planner(10_000, 2_000), None).unwrap_err();
        assert!(err
            .to_string()
            .contains("couldn't get under token limit with conversation summary"));
    }

    #[test]
    fn test_convo_cap_triggers_summarization_even_under_request_budget() {
        let convo = vec![msg("m1", 1, 900), msg("m2", 2, 900), msg("m3", 3, 100)];
        let summaries = vec![summary("m2", 100, 1)];
        // request budget is huge, but the standalone convo cap is 1000
        let plan = plan_conversation(&convo, &summaries, 0, &planner(1_000_000, 1_000), None).unwrap();
        assert!(plan.summary.is_some());
        assert_eq!(plan.convo_tokens, 200);
    }
}
