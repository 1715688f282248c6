//! Build Results
//!
//! A `PlanBuild` is one build attempt for a `(convoMessage, path)`. Its
//! validated output is a `PlanFileResult`: an ordered list of old-to-new
//! replacements (or a removal marker) that deterministically reproduces the
//! updated file from the pre-build state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single build attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBuild {
    pub id: String,
    pub plan_id: String,
    pub convo_message_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PlanBuild {
    pub fn new(
        plan_id: impl Into<String>,
        convo_message_id: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.into(),
            convo_message_id: convo_message_id.into(),
            file_path: file_path.into(),
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// One ordered old-to-new substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replacement {
    pub id: String,
    pub old: String,
    pub new: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: String,
}

impl Replacement {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            old: old.into(),
            new: new.into(),
            failed: false,
            rejected_at: None,
            summary: String::new(),
        }
    }
}

/// The validated output of a build. Stored as `<id>.json` under `results/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFileResult {
    pub id: String,
    pub plan_id: String,
    pub plan_build_id: String,
    pub convo_message_id: String,
    pub path: String,
    /// Full content for new files; empty when `replacements` carry the change
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<Replacement>,
    #[serde(default)]
    pub removed_file: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syntax_errors: Vec<String>,
    #[serde(default)]
    pub will_check_syntax: bool,
    #[serde(default)]
    pub syntax_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanFileResult {
    pub fn new(
        plan_id: impl Into<String>,
        plan_build_id: impl Into<String>,
        convo_message_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.into(),
            plan_build_id: plan_build_id.into(),
            convo_message_id: convo_message_id.into(),
            path: path.into(),
            content: String::new(),
            replacements: Vec::new(),
            removed_file: false,
            syntax_errors: Vec::new(),
            will_check_syntax: false,
            syntax_valid: false,
            applied_at: None,
            rejected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A result is pending iff it is neither applied nor rejected.
    pub fn is_pending(&self) -> bool {
        self.applied_at.is_none() && self.rejected_at.is_none()
    }

    /// Mark applied. Idempotent: a second apply keeps the first timestamp.
    pub fn apply(&mut self, now: DateTime<Utc>) {
        if self.applied_at.is_none() {
            self.applied_at = Some(now);
            self.updated_at = now;
        }
    }

    /// Mark the whole result rejected. The caller persists the mutation.
    pub fn reject(&mut self, now: DateTime<Utc>) {
        if self.rejected_at.is_none() {
            self.rejected_at = Some(now);
            for replacement in &mut self.replacements {
                if replacement.rejected_at.is_none() {
                    replacement.rejected_at = Some(now);
                }
            }
            self.updated_at = now;
        }
    }

    /// Apply the ordered replacements to `pre_build_state`.
    ///
    /// Each replacement substitutes its first occurrence; a miss marks the
    /// replacement failed and is reported in the error. For new or removed
    /// files the stored `content` wins.
    pub fn apply_replacements(&mut self, pre_build_state: &str) -> Result<String, String> {
        if self.removed_file {
            return Ok(String::new());
        }
        if self.replacements.is_empty() {
            return Ok(self.content.clone());
        }

        let mut updated = pre_build_state.to_string();
        let mut failed_paths = Vec::new();

        for replacement in &mut self.replacements {
            match updated.find(&replacement.old) {
                Some(idx) => {
                    updated.replace_range(idx..idx + replacement.old.len(), &replacement.new);
                }
                None => {
                    replacement.failed = true;
                    failed_paths.push(replacement.id.clone());
                }
            }
        }

        if failed_paths.is_empty() {
            Ok(updated)
        } else {
            Err(format!(
                "{} replacement(s) failed to match: {}",
                failed_paths.len(),
                failed_paths.join(", ")
            ))
        }
    }
}
