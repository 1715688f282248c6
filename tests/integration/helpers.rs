//! Shared test fixtures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use plandex_core::stream::StreamMessage;
use plandex_server::models::{ModelPack, ModelRoleConfig, Plan, PlanSettings};
use plandex_server::storage::Database;
use plandex_server::testing::ScriptedProvider;
use plandex_server::ServerState;
use tokio::sync::mpsc::UnboundedReceiver;

pub const ORG: &str = "org-1";
pub const USER: &str = "user-1";

/// A server over a temp dir with a scripted provider and one created plan.
pub struct TestHarness {
    pub server: Arc<ServerState>,
    pub provider: Arc<ScriptedProvider>,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new_in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let server = ServerState::new(dir.path(), db, Arc::clone(&provider) as _);
        Self {
            server,
            provider,
            _dir: dir,
        }
    }

    /// Create a plan directory + repo and write settings with one distinct
    /// model name per role, so scripted responses can be routed.
    pub fn create_plan(&self, plan_id: &str, name: &str) -> Plan {
        self.server.create_plan_dir(ORG, plan_id).unwrap();

        let settings = role_named_settings();
        self.server
            .plan_fs(ORG, plan_id)
            .store_settings(&settings)
            .unwrap();

        Plan {
            id: plan_id.to_string(),
            org_id: ORG.to_string(),
            owner_id: USER.to_string(),
            project_id: "proj-1".to_string(),
            name: name.to_string(),
            total_replies: 0,
            active_branches: 1,
            archived_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// A model pack where every role has its own model name.
pub fn role_named_settings() -> PlanSettings {
    let role = |name: &str| ModelRoleConfig::new(name);
    PlanSettings {
        model_pack: ModelPack {
            name: "test-pack".into(),
            planner: role("planner-m"),
            context_loader: role("context-m"),
            coder: role("coder-m"),
            builder: role("builder-m"),
            whole_file_builder: role("whole-m"),
            namer: role("namer-m"),
            describer: role("describer-m"),
            summarizer: role("summary-m"),
            exec_status: role("exec-m"),
        },
        auto_context: false,
        auto_continue: true,
    }
}

/// Drain the subscriber stream until the terminal message (or error),
/// returning every message seen, flattening `Multi` batches.
pub async fn collect_until_finished(
    rx: &mut UnboundedReceiver<StreamMessage>,
    timeout: Duration,
) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for stream to finish")
            .expect("stream closed before terminal message");

        let mut terminal = false;
        flatten_into(&mut messages, msg, &mut terminal);
        if terminal {
            return messages;
        }
    }
}

fn flatten_into(out: &mut Vec<StreamMessage>, msg: StreamMessage, terminal: &mut bool) {
    match msg {
        StreamMessage::Multi { messages } => {
            for inner in messages {
                flatten_into(out, inner, terminal);
            }
        }
        other => {
            if matches!(other, StreamMessage::Finished | StreamMessage::Error { .. }) {
                *terminal = true;
            }
            out.push(other);
        }
    }
}

/// The concatenated reply text from a message transcript.
pub fn reply_text(messages: &[StreamMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::Reply { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}
