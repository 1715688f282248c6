//! Plans and Branches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a branch while a stream runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Replying,
    Building,
    Finished,
    Error,
    Describing,
    MissingFile,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Replying => "replying",
            PlanStatus::Building => "building",
            PlanStatus::Finished => "finished",
            PlanStatus::Error => "error",
            PlanStatus::Describing => "describing",
            PlanStatus::MissingFile => "missing_file",
        };
        write!(f, "{}", s)
    }
}

/// Root aggregate: a named unit of AI-assisted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub org_id: String,
    pub owner_id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub total_replies: usize,
    #[serde(default)]
    pub active_branches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// New plans are named "draft" until the namer model renames them on first use.
    pub fn is_draft(&self) -> bool {
        self.name == "draft"
    }
}

/// A named line of history within a plan, backed by a git branch of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub plan_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    pub status: PlanStatus,
    /// Sum of NumTokens over all live contexts on this branch
    #[serde(default)]
    pub context_tokens: usize,
    /// Sum of Tokens over all conversation messages on this branch
    #[serde(default)]
    pub convo_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(plan_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.into(),
            name: name.into(),
            parent_branch_id: None,
            status: PlanStatus::Draft,
            context_tokens: 0,
            convo_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
