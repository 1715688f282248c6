//! Plan Settings and Model Pack
//!
//! Injected configuration: which model fills each role, sampling parameters,
//! and token ceilings. Prompt wording and tokenizer specifics are the
//! caller's concern; the core only reads these knobs.

use serde::{Deserialize, Serialize};

/// Configuration for a single model role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRoleConfig {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Effective input-token ceiling for requests in this role
    pub max_input_tokens: usize,
    /// Output tokens reserved when budgeting a request
    pub reserved_output_tokens: usize,
    /// Conversation-token ceiling before summary substitution kicks in
    #[serde(default)]
    pub max_convo_tokens: usize,
    /// Stronger model swapped in after repeated validation failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strong_model: Option<Box<ModelRoleConfig>>,
    /// Whether the provider supports predicted outputs for this model
    #[serde(default)]
    pub predicted_output_enabled: bool,
    /// Large-input variant used when the input-token bucket overflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_input_model: Option<Box<ModelRoleConfig>>,
    /// Chunk inactivity timeout in seconds for streams in this role
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
}

fn default_chunk_timeout_secs() -> u64 {
    120
}

impl ModelRoleConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            temperature: None,
            top_p: None,
            max_input_tokens: 120_000,
            reserved_output_tokens: 8_192,
            max_convo_tokens: 30_000,
            strong_model: None,
            predicted_output_enabled: false,
            large_input_model: None,
            chunk_timeout_secs: default_chunk_timeout_secs(),
        }
    }

    /// Planner budget: input ceiling minus reserved output.
    pub fn effective_max_tokens(&self) -> usize {
        self.max_input_tokens.saturating_sub(self.reserved_output_tokens)
    }

    /// Pick this config or its large-input variant by input-token bucket.
    pub fn for_input_tokens(&self, input_tokens: usize) -> &ModelRoleConfig {
        if input_tokens > self.effective_max_tokens() {
            if let Some(large) = &self.large_input_model {
                return large;
            }
        }
        self
    }
}

/// The set of model roles a plan runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPack {
    pub name: String,
    /// Drives the planning stage
    pub planner: ModelRoleConfig,
    /// Drives the context-loading phase (architect)
    pub context_loader: ModelRoleConfig,
    /// Drives the implementation stage
    pub coder: ModelRoleConfig,
    /// Drives the validate/correct build loop
    pub builder: ModelRoleConfig,
    /// Drives the whole-file fallback
    pub whole_file_builder: ModelRoleConfig,
    /// Names draft plans
    pub namer: ModelRoleConfig,
    /// Generates commit messages and descriptions
    pub describer: ModelRoleConfig,
    /// Rolling conversation summaries
    pub summarizer: ModelRoleConfig,
    /// Exec-status classifier
    pub exec_status: ModelRoleConfig,
}

impl ModelPack {
    /// A uniform pack where every role uses the same model. Handy for tests
    /// and single-model deployments.
    pub fn uniform(name: impl Into<String>, model: impl Into<String>) -> Self {
        let role = ModelRoleConfig::new(model);
        Self {
            name: name.into(),
            planner: role.clone(),
            context_loader: role.clone(),
            coder: role.clone(),
            builder: role.clone(),
            whole_file_builder: role.clone(),
            namer: role.clone(),
            describer: role.clone(),
            summarizer: role.clone(),
            exec_status: role,
        }
    }
}

/// Per-plan settings. Stored as `settings.json` in the plan directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSettings {
    pub model_pack: ModelPack,
    #[serde(default)]
    pub auto_context: bool,
    #[serde(default = "default_true")]
    pub auto_continue: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            model_pack: ModelPack::uniform("default", "gpt-4o"),
            auto_context: false,
            auto_continue: true,
        }
    }
}
