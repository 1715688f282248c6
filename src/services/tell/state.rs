//! Tell Iteration State
//!
//! Everything one iteration of the tell loop works with: the loaded plan
//! artifacts, the resolved stage, the assembled messages, and the streaming
//! parser state.

use std::collections::HashSet;
use std::sync::Arc;

use plandex_llm::ChatMessage;

use super::{load, stage, ExecTellParams};
use crate::models::{
    Context, ConvoMessage, ConvoSummary, CurrentStage, Plan, PlanSettings, Subtask, TellRequest,
};
use crate::services::active::{ActivePlan, MissingFileChoice};
use crate::services::reply::{ChunkProcessor, ReplyParser};
use crate::state::ServerState;
use crate::utils::error::AppResult;

pub struct TellState {
    pub server: Arc<ServerState>,
    pub plan: Plan,
    pub branch: String,
    pub user_id: String,
    pub req: TellRequest,
    pub iteration: usize,
    pub missing_file_response: Option<MissingFileChoice>,
    pub should_build_pending: bool,

    // loaded plan artifacts
    pub settings: PlanSettings,
    pub contexts: Vec<Arc<Context>>,
    pub convo: Vec<ConvoMessage>,
    pub summaries: Vec<ConvoSummary>,
    pub subtasks: Vec<Subtask>,
    pub has_context_map: bool,
    pub context_map_empty: bool,
    /// The latest real user prompt (not a continue wrapper)
    pub user_prompt: String,
    /// Id of the user message stored this iteration; excluded from request
    /// assembly since the wrapped prompt stands in for it
    pub prompt_message_id: Option<String>,

    // resolved stage
    pub current_stage: CurrentStage,
    pub activated_paths: HashSet<String>,

    // request assembly
    pub messages: Vec<ChatMessage>,
    pub tokens_before_convo: usize,
    /// Summary substituted into the conversation, if any
    pub summarized_to_message_id: Option<String>,

    // streaming
    pub reply_id: String,
    pub parser: ReplyParser,
    pub processor: ChunkProcessor,
    pub reply_num_tokens: usize,
}

impl TellState {
    /// The current subtask: first unfinished in order.
    pub fn current_subtask(&self) -> Option<&Subtask> {
        crate::models::subtask::current_subtask(&self.subtasks)
    }

    pub fn active_plan(&self) -> Option<Arc<ActivePlan>> {
        self.server.registry.get(&self.plan.id, &self.branch)
    }

    /// Load plan artifacts under a repo lock, resolve the stage, and prepare
    /// parser state for the iteration.
    pub async fn load(params: ExecTellParams) -> AppResult<Self> {
        let mut state = Self {
            server: params.server,
            plan: params.plan,
            branch: params.branch,
            user_id: params.user_id,
            req: params.req,
            iteration: params.iteration,
            missing_file_response: params.missing_file_response,
            should_build_pending: params.should_build_pending,
            settings: PlanSettings::default(),
            contexts: Vec::new(),
            convo: Vec::new(),
            summaries: Vec::new(),
            subtasks: Vec::new(),
            has_context_map: false,
            context_map_empty: true,
            user_prompt: String::new(),
            prompt_message_id: None,
            current_stage: CurrentStage::default(),
            activated_paths: HashSet::new(),
            messages: Vec::new(),
            tokens_before_convo: 0,
            summarized_to_message_id: None,
            reply_id: uuid::Uuid::new_v4().to_string(),
            parser: ReplyParser::new(),
            processor: ChunkProcessor::new(),
            reply_num_tokens: 0,
        };

        load::load_tell_plan(&mut state).await?;
        stage::resolve_current_stage(&mut state);
        load::sync_active_plan(&mut state);

        Ok(state)
    }
}
