//! Tell Request
//!
//! The request contract the external API layer hands to the tell pipeline.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Whether completed operations are built as they stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildMode {
    #[default]
    Auto,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TellRequest {
    pub prompt: String,
    #[serde(default)]
    pub build_mode: BuildMode,
    /// Continue the plan from where it left off instead of a fresh prompt
    #[serde(default)]
    pub is_user_continue: bool,
    /// Conversation only: no operations are parsed into builds
    #[serde(default)]
    pub is_chat_only: bool,
    #[serde(default)]
    pub auto_context: bool,
    /// All known project paths, used for missing-file detection
    #[serde(default)]
    pub project_paths: HashSet<String>,
    /// Debugging a failing command: prompt gets the debug suffix
    #[serde(default)]
    pub is_debug: bool,
    /// Debugging a failed apply: prompt gets the apply-debug suffix and the
    /// context phase is skipped
    #[serde(default)]
    pub is_apply_debug: bool,
    #[serde(default)]
    pub session_id: String,
}
