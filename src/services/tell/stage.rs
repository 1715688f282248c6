//! Stage Resolution
//!
//! Decides where an iteration sits in the state machine:
//!
//! ```text
//! Planning[Context]  ->  Planning[Tasks]  ->  Implementation
//!          ^                    ^                    |
//!          |                    +--------------------+  (next subtask)
//!          +-- follow-up needing context clear ---------
//! ```

use super::TellState;
use crate::models::{CurrentStage, PlanningPhase, TellStage, ROLE_ASSISTANT, ROLE_USER};

pub fn resolve_current_stage(state: &mut TellState) {
    let last_msg = state
        .convo
        .iter()
        .rev()
        .find(|m| !m.stopped && !m.flags.has_error);

    let is_continue_from_assistant = state.iteration == 0
        && state.req.is_user_continue
        && last_msg.map(|m| m.role == ROLE_ASSISTANT).unwrap_or(false);

    let is_user_prompt = !is_continue_from_assistant
        && last_msg.map(|m| m.role == ROLE_USER).unwrap_or(true);

    let tell_stage = if is_user_prompt {
        TellStage::Planning
    } else if last_msg
        .map(|m| {
            m.flags.did_make_plan
                || m.flags.current_stage.tell_stage == TellStage::Implementation
        })
        .unwrap_or(false)
    {
        TellStage::Implementation
    } else {
        TellStage::Planning
    };

    // a context phase never repeats back to back; its activated paths carry
    // forward into the planning phase that follows it
    let mut was_context_stage = false;
    if let Some(msg) = last_msg {
        let flags_stage = msg.flags.current_stage;
        if flags_stage.tell_stage == TellStage::Planning
            && flags_stage.planning_phase == PlanningPhase::Context
        {
            was_context_stage = true;
            state.activated_paths = msg
                .activated_paths
                .iter()
                .filter(|(_, v)| **v)
                .map(|(k, _)| k.clone())
                .collect();
        }
    }

    let planning_phase = if tell_stage == TellStage::Planning {
        if state.req.auto_context
            && state.has_context_map
            && !state.context_map_empty
            && !was_context_stage
            && !state.req.is_apply_debug
        {
            PlanningPhase::Context
        } else {
            PlanningPhase::Tasks
        }
    } else {
        PlanningPhase::default()
    };

    state.current_stage = CurrentStage {
        tell_stage,
        planning_phase,
    };

    tracing::debug!(
        plan_id = %state.plan.id,
        stage = ?state.current_stage,
        "resolved current stage"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConvoMessage, ConvoMessageFlags, Plan, TellRequest};
    use crate::services::tell::TellState;
    use crate::state::ServerState;
    use crate::storage::Database;
    use crate::testing::ScriptedProvider;
    use chrono::Utc;
    use std::sync::Arc;

    fn message(role: &str, flags: ConvoMessageFlags) -> ConvoMessage {
        ConvoMessage {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: "p1".into(),
            user_id: "u1".into(),
            role: role.into(),
            num: 1,
            tokens: 1,
            message: "msg".into(),
            stopped: false,
            flags,
            reply_type: Default::default(),
            subtask: None,
            added_subtasks: vec![],
            removed_subtasks: vec![],
            activated_paths: Default::default(),
            activated_paths_ordered: vec![],
            created_at: Utc::now(),
        }
    }

    fn state_with(convo: Vec<ConvoMessage>, req: TellRequest, has_map: bool) -> TellState {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().unwrap();
        let server = ServerState::new(dir.path(), db, Arc::new(ScriptedProvider::new(vec![])));
        TellState {
            server,
            plan: Plan {
                id: "p1".into(),
                org_id: "o1".into(),
                owner_id: "u1".into(),
                project_id: "proj".into(),
                name: "plan".into(),
                total_replies: 0,
                active_branches: 1,
                archived_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            branch: "main".into(),
            user_id: "u1".into(),
            req,
            iteration: 0,
            missing_file_response: None,
            should_build_pending: false,
            settings: Default::default(),
            contexts: vec![],
            convo,
            summaries: vec![],
            subtasks: vec![],
            has_context_map: has_map,
            context_map_empty: !has_map,
            user_prompt: "prompt".into(),
            prompt_message_id: None,
            current_stage: Default::default(),
            activated_paths: Default::default(),
            messages: vec![],
            tokens_before_convo: 0,
            summarized_to_message_id: None,
            reply_id: "r1".into(),
            parser: crate::services::reply::ReplyParser::new(),
            processor: crate::services::reply::ChunkProcessor::new(),
            reply_num_tokens: 0,
        }
    }

    #[test]
    fn test_user_prompt_starts_planning() {
        let mut state = state_with(
            vec![message(ROLE_USER, Default::default())],
            TellRequest::default(),
            false,
        );
        resolve_current_stage(&mut state);
        assert_eq!(state.current_stage.tell_stage, TellStage::Planning);
        assert_eq!(state.current_stage.planning_phase, PlanningPhase::Tasks);
    }

    #[test]
    fn test_auto_context_with_map_starts_context_phase() {
        let req = TellRequest {
            auto_context: true,
            ..Default::default()
        };
        let mut state = state_with(vec![message(ROLE_USER, Default::default())], req, true);
        resolve_current_stage(&mut state);
        assert_eq!(state.current_stage.planning_phase, PlanningPhase::Context);
    }

    #[test]
    fn test_did_make_plan_moves_to_implementation() {
        let flags = ConvoMessageFlags {
            did_make_plan: true,
            ..Default::default()
        };
        let mut state = state_with(
            vec![message(ROLE_ASSISTANT, flags)],
            TellRequest::default(),
            false,
        );
        resolve_current_stage(&mut state);
        assert_eq!(state.current_stage.tell_stage, TellStage::Implementation);
    }

    #[test]
    fn test_implementation_continues() {
        let flags = ConvoMessageFlags {
            current_stage: CurrentStage {
                tell_stage: TellStage::Implementation,
                planning_phase: PlanningPhase::Tasks,
            },
            ..Default::default()
        };
        let mut state = state_with(
            vec![message(ROLE_ASSISTANT, flags)],
            TellRequest::default(),
            false,
        );
        resolve_current_stage(&mut state);
        assert_eq!(state.current_stage.tell_stage, TellStage::Implementation);
    }

    #[test]
    fn test_context_phase_never_repeats() {
        let mut flags = ConvoMessageFlags::default();
        flags.current_stage = CurrentStage {
            tell_stage: TellStage::Planning,
            planning_phase: PlanningPhase::Context,
        };
        let mut msg = message(ROLE_ASSISTANT, flags);
        msg.activated_paths.insert("src/a.rs".into(), true);

        let req = TellRequest {
            auto_context: true,
            ..Default::default()
        };
        let mut state = state_with(vec![msg], req, true);
        resolve_current_stage(&mut state);
        assert_eq!(state.current_stage.planning_phase, PlanningPhase::Tasks);
        assert!(state.activated_paths.contains("src/a.rs"));
    }
}
