//! Conversation Messages, Summaries, and Descriptions

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use plandex_core::Operation;
use serde::{Deserialize, Serialize};

use super::subtask::Subtask;

/// Top-level stage of the tell state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TellStage {
    #[default]
    Planning,
    Implementation,
}

/// Sub-phase inside the planning stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningPhase {
    /// Deciding what context to load
    Context,
    /// Producing the task list
    #[default]
    Tasks,
}

/// The stage a reply was produced in, recorded on the message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStage {
    pub tell_stage: TellStage,
    pub planning_phase: PlanningPhase,
}

/// What kind of reply an assistant turn was.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyType {
    #[default]
    Chat,
    LoadedContext,
    MadePlan,
    Implementation,
    ContextAssessment,
}

/// Flags recorded on each assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoMessageFlags {
    #[serde(default)]
    pub did_make_plan: bool,
    #[serde(default)]
    pub did_write_code: bool,
    #[serde(default)]
    pub did_load_context: bool,
    #[serde(default)]
    pub did_complete_task: bool,
    #[serde(default)]
    pub did_complete_plan: bool,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub current_stage: CurrentStage,
}

/// A single conversation turn. Stored as `<id>.json` under `conversation/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoMessage {
    pub id: String,
    pub plan_id: String,
    pub user_id: String,
    /// "user" or "assistant"
    pub role: String,
    /// Strictly monotonic per branch, starting at 1
    pub num: usize,
    pub tokens: usize,
    pub message: String,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub flags: ConvoMessageFlags,
    #[serde(default)]
    pub reply_type: ReplyType,
    /// The subtask this reply worked on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<Subtask>,
    /// Subtasks this reply added
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_subtasks: Vec<Subtask>,
    /// Titles of subtasks this reply removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_subtasks: Vec<String>,
    /// Project paths the context phase activated
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub activated_paths: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activated_paths_ordered: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// Rolling conversation summary window.
///
/// Summaries are strictly ordered by `latest_convo_message_created_at`; the
/// latest summary covers a contiguous prefix of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoSummary {
    pub id: String,
    pub plan_id: String,
    pub latest_convo_message_id: String,
    pub latest_convo_message_created_at: DateTime<Utc>,
    pub summary: String,
    pub tokens: usize,
    pub num_messages: usize,
    pub created_at: DateTime<Utc>,
}

/// Post-reply metadata. Stored as `<id>.json` under `descriptions/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoMessageDescription {
    pub id: String,
    pub plan_id: String,
    pub convo_message_id: String,
    #[serde(default)]
    pub summarized_to_message_id: String,
    #[serde(default)]
    pub wrote_files: bool,
    #[serde(default)]
    pub commit_msg: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub did_build: bool,
    /// Paths whose pending builds were invalidated by a later context load
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub build_paths_invalidated: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConvoMessageDescription {
    /// A description with operations that has not been applied still has
    /// pending builds.
    pub fn has_pending_builds(&self) -> bool {
        self.applied_at.is_none()
            && self.error.is_none()
            && self
                .operations
                .iter()
                .any(|op| !self.build_paths_invalidated.contains_key(&op.path))
    }
}
