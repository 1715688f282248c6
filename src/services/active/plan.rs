//! Active Plan
//!
//! The in-memory coordinator of a single live stream and its dependent
//! builds. Never persisted; shared by every task participating in the
//! stream and destroyed when the stream finishes after all builds drain.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plandex_core::stream::{ApiError, StreamMessage};
use plandex_core::Operation;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::models::{Context, PlanStatus};

/// Stream messages faster than this are buffered and coalesced.
pub const MAX_STREAM_RATE: Duration = Duration::from_millis(70);

/// A whole plan stream times out after this long.
pub const ACTIVE_PLAN_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Client response to a missing-file prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingFileChoice {
    /// Allow the model to overwrite the file
    Overwrite,
    /// Skip the file and continue from the pre-file reply prefix
    Skip,
    /// Load the file into context and continue (auto-context mode)
    Load,
}

#[derive(Debug, Default)]
struct BuildStatus {
    success: bool,
    error: Option<String>,
}

/// One queued build for a path.
#[derive(Debug)]
pub struct ActiveBuild {
    pub reply_id: String,
    pub path: String,
    pub file_description: String,
    pub file_content: String,
    pub file_content_tokens: usize,
    pub move_destination: Option<String>,
    pub is_move_op: bool,
    pub is_remove_op: bool,
    pub is_reset_op: bool,
    status: Mutex<BuildStatus>,
}

impl ActiveBuild {
    pub fn from_operation(reply_id: &str, op: &Operation, content_tokens: usize) -> Arc<Self> {
        use plandex_core::OperationType;
        Arc::new(Self {
            reply_id: reply_id.to_string(),
            path: op.path.clone(),
            file_description: op.description.clone(),
            file_content: op.content.clone(),
            file_content_tokens: content_tokens,
            move_destination: op.destination.clone(),
            is_move_op: op.op_type == OperationType::Move,
            is_remove_op: op.op_type == OperationType::Remove,
            is_reset_op: op.op_type == OperationType::Reset,
            status: Mutex::new(BuildStatus::default()),
        })
    }

    pub fn file_build(reply_id: &str, path: &str, content: &str, description: &str) -> Arc<Self> {
        Arc::new(Self {
            reply_id: reply_id.to_string(),
            path: path.to_string(),
            file_description: description.to_string(),
            file_content: content.to_string(),
            file_content_tokens: plandex_llm::estimate_tokens(content),
            move_destination: None,
            is_move_op: false,
            is_remove_op: false,
            is_reset_op: false,
            status: Mutex::new(BuildStatus::default()),
        })
    }

    pub fn remove_build(reply_id: &str, path: &str) -> Arc<Self> {
        Arc::new(Self {
            reply_id: reply_id.to_string(),
            path: path.to_string(),
            file_description: String::new(),
            file_content: String::new(),
            file_content_tokens: 0,
            move_destination: None,
            is_move_op: false,
            is_remove_op: true,
            is_reset_op: false,
            status: Mutex::new(BuildStatus::default()),
        })
    }

    pub fn is_file_operation(&self) -> bool {
        self.is_move_op || self.is_remove_op || self.is_reset_op
    }

    pub fn mark_success(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.success = true;
    }

    pub fn mark_error(&self, msg: impl Into<String>) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.error = Some(msg.into());
    }

    pub fn error(&self) -> Option<String> {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    pub fn finished(&self) -> bool {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.success || status.error.is_some()
    }
}

/// Mutable bookkeeping guarded by one mutex; everything else on the plan is
/// either immutable or its own synchronization primitive.
#[derive(Default)]
pub struct ActivePlanState {
    pub status: Option<PlanStatus>,
    /// Every status this stream has passed through, in order
    pub status_history: Vec<PlanStatus>,
    pub current_streaming_reply_id: Option<String>,
    pub current_reply_content: String,
    pub num_tokens: usize,
    pub message_num: usize,
    pub contexts: Vec<Arc<Context>>,
    pub contexts_by_path: HashMap<String, Arc<Context>>,
    pub operations: Vec<Operation>,
    pub built_files: HashSet<String>,
    pub is_building_by_path: HashMap<String, bool>,
    pub build_queues_by_path: HashMap<String, Vec<Arc<ActiveBuild>>>,
    pub replies_finished: bool,
    pub missing_file_path: Option<String>,
    pub allow_overwrite_paths: HashSet<String>,
    pub skipped_paths: HashSet<String>,
    pub stored_reply_ids: Vec<String>,
    pub did_edit_files: bool,
}

struct StreamBuffer {
    buffer: Vec<StreamMessage>,
    last_sent: Instant,
}

/// The in-memory coordinator of one live plan stream.
pub struct ActivePlan {
    pub id: String,
    pub branch: String,
    pub org_id: String,
    pub user_id: String,
    pub prompt: String,
    pub build_only: bool,
    pub auto_context: bool,
    pub session_id: String,
    pub model_stream_id: String,

    /// Plan-wide cancellation; cancels builds, heartbeats, everything
    pub ctx: CancellationToken,
    /// Independent of the plan: summaries survive stream end
    pub summary_ctx: CancellationToken,
    /// Cancellable separately to pause the model stream (missing-file flow)
    model_stream_ctx: Mutex<CancellationToken>,

    state: Mutex<ActivePlanState>,

    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<StreamMessage>>>,
    stream_buf: Mutex<StreamBuffer>,

    done_tx: mpsc::UnboundedSender<Option<ApiError>>,
    done_rx: Mutex<Option<mpsc::UnboundedReceiver<Option<ApiError>>>>,

    reply_done_tx: Mutex<watch::Sender<bool>>,
    reply_done_rx: Mutex<watch::Receiver<bool>>,

    missing_file_tx: mpsc::Sender<MissingFileChoice>,
    missing_file_rx: tokio::sync::Mutex<mpsc::Receiver<MissingFileChoice>>,

    auto_load_tx: mpsc::Sender<()>,
    auto_load_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl ActivePlan {
    pub fn new(
        org_id: &str,
        user_id: &str,
        plan_id: &str,
        branch: &str,
        prompt: &str,
        build_only: bool,
        auto_context: bool,
        session_id: &str,
    ) -> Arc<Self> {
        let ctx = CancellationToken::new();
        let model_stream_ctx = ctx.child_token();
        let summary_ctx = CancellationToken::new();

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (reply_done_tx, reply_done_rx) = watch::channel(false);
        let (missing_file_tx, missing_file_rx) = mpsc::channel(1);
        let (auto_load_tx, auto_load_rx) = mpsc::channel(1);

        let plan = Arc::new(Self {
            id: plan_id.to_string(),
            branch: branch.to_string(),
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            prompt: prompt.to_string(),
            build_only,
            auto_context,
            session_id: session_id.to_string(),
            model_stream_id: uuid::Uuid::new_v4().to_string(),
            ctx: ctx.clone(),
            summary_ctx,
            model_stream_ctx: Mutex::new(model_stream_ctx),
            state: Mutex::new(ActivePlanState::default()),
            subscriptions: Mutex::new(HashMap::new()),
            stream_buf: Mutex::new(StreamBuffer {
                buffer: Vec::new(),
                last_sent: Instant::now() - MAX_STREAM_RATE,
            }),
            done_tx,
            done_rx: Mutex::new(Some(done_rx)),
            reply_done_tx: Mutex::new(reply_done_tx),
            reply_done_rx: Mutex::new(reply_done_rx),
            missing_file_tx,
            missing_file_rx: tokio::sync::Mutex::new(missing_file_rx),
            auto_load_tx,
            auto_load_rx: tokio::sync::Mutex::new(auto_load_rx),
        });

        // hard timeout on the whole plan
        let timeout_ctx = ctx;
        tokio::spawn(async move {
            tokio::select! {
                _ = timeout_ctx.cancelled() => {}
                _ = tokio::time::sleep(ACTIVE_PLAN_TIMEOUT) => {
                    tracing::warn!("active plan timed out, canceling");
                    timeout_ctx.cancel();
                }
            }
        });

        plan
    }

    // ── State access ───────────────────────────────────────────────────

    /// Record a status transition for the stream.
    pub fn set_status(&self, status: PlanStatus) {
        self.update(|s| {
            if s.status != Some(status) {
                s.status = Some(status);
                s.status_history.push(status);
            }
        });
        tracing::debug!(plan_id = %self.id, branch = %self.branch, %status, "plan status");
    }

    /// Apply `f` to the mutable state under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ActivePlanState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Read the state under its lock.
    pub fn read<R>(&self, f: impl FnOnce(&ActivePlanState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    // ── Cancellation tokens ────────────────────────────────────────────

    /// The current model stream token (cancellable without killing the plan).
    pub fn model_stream_ctx(&self) -> CancellationToken {
        self.model_stream_ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel only the model stream, pausing it for a missing-file prompt.
    pub fn cancel_model_stream(&self) {
        self.model_stream_ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    /// Replace the model stream token after a pause, parented to the plan.
    pub fn reset_model_ctx(&self) {
        let mut guard = self
            .model_stream_ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = self.ctx.child_token();
    }

    // ── Reply lifecycle ────────────────────────────────────────────────

    /// Start streaming a reply: fresh reply-done signal for waiting builds.
    pub fn begin_reply(&self, reply_id: &str) {
        let (tx, rx) = watch::channel(false);
        *self.reply_done_tx.lock().unwrap_or_else(|e| e.into_inner()) = tx;
        *self.reply_done_rx.lock().unwrap_or_else(|e| e.into_inner()) = rx;
        self.update(|s| {
            s.current_streaming_reply_id = Some(reply_id.to_string());
        });
    }

    /// Signal that the current reply has been stored.
    pub fn finish_reply(&self) {
        self.update(|s| s.current_streaming_reply_id = None);
        let tx = self.reply_done_tx.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send(true);
    }

    /// Block until the given reply is stored, if it is still streaming.
    pub async fn wait_for_reply_stored(&self, reply_id: &str) {
        let still_streaming = self.read(|s| {
            s.current_streaming_reply_id.as_deref() == Some(reply_id)
        });
        if !still_streaming {
            return;
        }
        let mut rx = self
            .reply_done_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        // value may already be true; wait_for returns immediately then
        let _ = rx.wait_for(|done| *done).await;
    }

    // ── Builds ─────────────────────────────────────────────────────────

    /// Queue a build for its path. Returns true if the caller should start a
    /// build worker for the path (none is running).
    pub fn queue_build(&self, build: Arc<ActiveBuild>) -> bool {
        self.update(|s| {
            let path = build.path.clone();
            s.build_queues_by_path
                .entry(path.clone())
                .or_default()
                .push(build);
            let is_building = s.is_building_by_path.get(&path).copied().unwrap_or(false);
            if !is_building {
                s.is_building_by_path.insert(path, true);
            }
            !is_building
        })
    }

    /// Next unfinished build for a path, if any.
    pub fn next_queued_build(&self, path: &str) -> Option<Arc<ActiveBuild>> {
        self.read(|s| {
            s.build_queues_by_path
                .get(path)
                .and_then(|q| q.iter().find(|b| !b.finished()).cloned())
        })
    }

    pub fn path_queue_empty(&self, path: &str) -> bool {
        self.read(|s| {
            s.build_queues_by_path
                .get(path)
                .map(|q| q.iter().all(|b| b.finished()))
                .unwrap_or(true)
        })
    }

    /// True once every queued build on every path has finished.
    pub fn build_finished(&self) -> bool {
        self.read(|s| {
            s.build_queues_by_path.iter().all(|(path, queue)| {
                let is_building = s.is_building_by_path.get(path).copied().unwrap_or(false);
                let queue_done = queue.iter().all(|b| b.finished());
                queue_done && !is_building
            })
        })
    }

    /// Mark a path's current build processed; returns whether the whole
    /// build set is now finished.
    pub fn finish_path_build(&self, path: &str) -> bool {
        self.update(|s| {
            s.built_files.insert(path.to_string());
            s.is_building_by_path.insert(path.to_string(), false);
        });
        self.build_finished()
    }

    // ── Subscriptions & streaming ──────────────────────────────────────

    pub fn subscribe(&self) -> (String, mpsc::UnboundedReceiver<StreamMessage>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn send_to_subscribers(&self, msg: StreamMessage) {
        let subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for tx in subs.values() {
            let _ = tx.send(msg.clone());
        }
    }

    /// Send a message to all subscribers, buffering bursts.
    ///
    /// Messages arriving faster than `MAX_STREAM_RATE` accumulate and go out
    /// as a single `Multi`. Control messages flush the buffer first and are
    /// never themselves buffered.
    pub fn stream(&self, msg: StreamMessage) {
        if msg.skips_buffer() {
            self.flush_stream_buffer();
            self.send_to_subscribers(msg);
            let mut buf = self.stream_buf.lock().unwrap_or_else(|e| e.into_inner());
            buf.last_sent = Instant::now();
            return;
        }

        let to_send = {
            let mut buf = self.stream_buf.lock().unwrap_or_else(|e| e.into_inner());
            if buf.last_sent.elapsed() < MAX_STREAM_RATE {
                buf.buffer.push(msg);
                return;
            }
            buf.last_sent = Instant::now();
            if buf.buffer.is_empty() {
                Some(msg)
            } else {
                buf.buffer.push(msg);
                let batch = std::mem::take(&mut buf.buffer);
                Some(StreamMessage::Multi { messages: batch })
            }
        };

        if let Some(msg) = to_send {
            self.send_to_subscribers(msg);
        }
    }

    /// Drain the buffer synchronously; used before control messages.
    pub fn flush_stream_buffer(&self) {
        let batch = {
            let mut buf = self.stream_buf.lock().unwrap_or_else(|e| e.into_inner());
            if buf.buffer.is_empty() {
                return;
            }
            buf.last_sent = Instant::now();
            std::mem::take(&mut buf.buffer)
        };
        if batch.len() == 1 {
            let mut batch = batch;
            self.send_to_subscribers(batch.remove(0));
        } else {
            self.send_to_subscribers(StreamMessage::Multi { messages: batch });
        }
    }

    // ── Terminal signalling ────────────────────────────────────────────

    /// Signal stream completion (`None`) or failure to whoever owns the
    /// done receiver.
    pub fn send_done(&self, result: Option<ApiError>) {
        let _ = self.done_tx.send(result);
    }

    /// Take the done receiver; the stream owner holds it for the lifetime
    /// of the request.
    pub fn take_done_rx(&self) -> Option<mpsc::UnboundedReceiver<Option<ApiError>>> {
        self.done_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    // ── Client interaction channels ────────────────────────────────────

    pub fn respond_missing_file(&self, choice: MissingFileChoice) -> bool {
        self.missing_file_tx.try_send(choice).is_ok()
    }

    pub async fn wait_missing_file_response(&self) -> Option<MissingFileChoice> {
        self.missing_file_rx.lock().await.recv().await
    }

    pub fn notify_auto_load_context(&self) -> bool {
        self.auto_load_tx.try_send(()).is_ok()
    }

    pub async fn wait_auto_load_context(&self) -> Option<()> {
        self.auto_load_rx.lock().await.recv().await
    }
}
