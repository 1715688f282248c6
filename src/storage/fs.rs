//! Plan File Store
//!
//! On-disk layout of a plan's artifacts, rooted at the plan directory:
//!
//! ```text
//! context/<uuid>.meta          JSON metadata (no body, no map parts)
//! context/<uuid>.body          raw body (backticks escaped)
//! context/<uuid>.map-parts     JSON {path: body}
//! conversation/<uuid>.json     ConvoMessage
//! descriptions/<uuid>.json     ConvoMessageDescription
//! results/<uuid>.json          PlanFileResult
//! summaries/<uuid>.json        ConvoSummary
//! settings.json                PlanSettings
//! subtasks.json                [Subtask]
//! .git/                        one git branch per Branch row
//! ```
//!
//! Everything here runs under a repo-queue lock; the store itself does no
//! locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use plandex_core::limits::{MAX_CONTEXT_BODY_SIZE, MAX_CONTEXT_COUNT, MAX_TOTAL_CONTEXT_SIZE};
use plandex_core::CoreError;

use crate::models::{
    Context, ConvoMessage, ConvoMessageDescription, ConvoSummary, PlanFileResult, PlanSettings,
    Subtask,
};
use crate::utils::error::{AppError, AppResult};

const CONTEXT_DIR: &str = "context";
const CONVERSATION_DIR: &str = "conversation";
const DESCRIPTIONS_DIR: &str = "descriptions";
const RESULTS_DIR: &str = "results";
const SUMMARIES_DIR: &str = "summaries";
const SETTINGS_FILE: &str = "settings.json";
const SUBTASKS_FILE: &str = "subtasks.json";

/// File store for one plan directory.
#[derive(Debug, Clone)]
pub struct PlanFs {
    plan_dir: PathBuf,
}

impl PlanFs {
    pub fn new(plan_dir: impl Into<PathBuf>) -> Self {
        Self {
            plan_dir: plan_dir.into(),
        }
    }

    pub fn plan_dir(&self) -> &Path {
        &self.plan_dir
    }

    /// Create the artifact directories.
    pub fn init(&self) -> AppResult<()> {
        for dir in [
            CONTEXT_DIR,
            CONVERSATION_DIR,
            DESCRIPTIONS_DIR,
            RESULTS_DIR,
            SUMMARIES_DIR,
        ] {
            std::fs::create_dir_all(self.plan_dir.join(dir))?;
        }
        Ok(())
    }

    // ── Contexts ───────────────────────────────────────────────────────

    fn context_meta_path(&self, id: &str) -> PathBuf {
        self.plan_dir.join(CONTEXT_DIR).join(format!("{}.meta", id))
    }

    fn context_body_path(&self, id: &str) -> PathBuf {
        self.plan_dir.join(CONTEXT_DIR).join(format!("{}.body", id))
    }

    fn context_map_parts_path(&self, id: &str) -> PathBuf {
        self.plan_dir
            .join(CONTEXT_DIR)
            .join(format!("{}.map-parts", id))
    }

    /// Persist a context as paired meta/body files (plus map parts for maps),
    /// enforcing the size and count limits.
    pub fn store_context(&self, context: &Context) -> AppResult<()> {
        if context.body.len() > MAX_CONTEXT_BODY_SIZE {
            return Err(AppError::Core(CoreError::user_input(format!(
                "context body exceeds maximum size ({} bytes)",
                MAX_CONTEXT_BODY_SIZE
            ))));
        }

        let existing = self.load_context_metas()?;
        let is_update = existing.iter().any(|c| c.id == context.id);

        if !is_update && existing.len() >= MAX_CONTEXT_COUNT {
            return Err(AppError::Core(CoreError::user_input(format!(
                "plan already has the maximum of {} contexts",
                MAX_CONTEXT_COUNT
            ))));
        }

        let other_total: usize = existing
            .iter()
            .filter(|c| c.id != context.id)
            .map(|c| c.body_size)
            .sum();
        if other_total + context.body.len() > MAX_TOTAL_CONTEXT_SIZE {
            return Err(AppError::Core(CoreError::user_input(format!(
                "total context size exceeds maximum ({} bytes)",
                MAX_TOTAL_CONTEXT_SIZE
            ))));
        }

        std::fs::create_dir_all(self.plan_dir.join(CONTEXT_DIR))?;
        let meta = serde_json::to_string_pretty(context)?;
        std::fs::write(self.context_meta_path(&context.id), meta)?;
        std::fs::write(
            self.context_body_path(&context.id),
            escape_backticks(&context.body),
        )?;

        if context.is_map() {
            let parts = serde_json::to_string_pretty(&context.map_parts)?;
            std::fs::write(self.context_map_parts_path(&context.id), parts)?;
        }

        Ok(())
    }

    /// Load context metadata records only (no bodies).
    pub fn load_context_metas(&self) -> AppResult<Vec<Context>> {
        let dir = self.plan_dir.join(CONTEXT_DIR);
        let mut contexts = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            contexts.push(serde_json::from_str::<Context>(&raw)?);
        }
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(contexts)
    }

    /// Load all contexts with bodies and map parts.
    pub fn load_contexts(&self) -> AppResult<Vec<Context>> {
        let mut contexts = self.load_context_metas()?;
        for context in &mut contexts {
            let body_path = self.context_body_path(&context.id);
            if body_path.exists() {
                context.body = unescape_backticks(&std::fs::read_to_string(body_path)?);
            }
            if context.is_map() {
                let parts_path = self.context_map_parts_path(&context.id);
                if parts_path.exists() {
                    let raw = std::fs::read_to_string(parts_path)?;
                    context.map_parts = serde_json::from_str::<HashMap<String, String>>(&raw)?;
                }
            }
        }
        Ok(contexts)
    }

    /// Delete a context's files. Tolerates files already gone.
    pub fn delete_context(&self, id: &str) -> AppResult<()> {
        for path in [
            self.context_meta_path(id),
            self.context_body_path(id),
            self.context_map_parts_path(id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ── Conversation ───────────────────────────────────────────────────

    pub fn store_convo_message(&self, message: &ConvoMessage) -> AppResult<()> {
        let dir = self.plan_dir.join(CONVERSATION_DIR);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(message)?;
        std::fs::write(dir.join(format!("{}.json", message.id)), json)?;
        Ok(())
    }

    /// Load the conversation ordered by message num.
    pub fn load_conversation(&self) -> AppResult<Vec<ConvoMessage>> {
        let dir = self.plan_dir.join(CONVERSATION_DIR);
        let mut messages = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            messages.push(serde_json::from_str::<ConvoMessage>(&raw)?);
        }
        messages.sort_by_key(|m| m.num);
        Ok(messages)
    }

    /// Next message num: contiguous, starting at 1.
    pub fn next_message_num(&self) -> AppResult<usize> {
        Ok(self.load_conversation()?.len() + 1)
    }

    // ── Descriptions ───────────────────────────────────────────────────

    pub fn store_description(&self, desc: &ConvoMessageDescription) -> AppResult<()> {
        let dir = self.plan_dir.join(DESCRIPTIONS_DIR);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(desc)?;
        std::fs::write(dir.join(format!("{}.json", desc.id)), json)?;
        Ok(())
    }

    pub fn load_descriptions(&self) -> AppResult<Vec<ConvoMessageDescription>> {
        let dir = self.plan_dir.join(DESCRIPTIONS_DIR);
        let mut descs = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            descs.push(serde_json::from_str::<ConvoMessageDescription>(&raw)?);
        }
        descs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(descs)
    }

    // ── Results ────────────────────────────────────────────────────────

    pub fn store_result(&self, result: &PlanFileResult) -> AppResult<()> {
        let dir = self.plan_dir.join(RESULTS_DIR);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(dir.join(format!("{}.json", result.id)), json)?;
        Ok(())
    }

    pub fn load_results(&self) -> AppResult<Vec<PlanFileResult>> {
        let dir = self.plan_dir.join(RESULTS_DIR);
        let mut results = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            results.push(serde_json::from_str::<PlanFileResult>(&raw)?);
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    pub fn delete_result(&self, id: &str) -> AppResult<()> {
        let path = self.plan_dir.join(RESULTS_DIR).join(format!("{}.json", id));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending results in creation order.
    pub fn pending_results(&self) -> AppResult<Vec<PlanFileResult>> {
        Ok(self
            .load_results()?
            .into_iter()
            .filter(|r| r.is_pending())
            .collect())
    }

    /// Current plan file contents: pending results folded over context-free
    /// starting states, newest last.
    pub fn current_plan_files(&self) -> AppResult<HashMap<String, String>> {
        let mut files: HashMap<String, String> = HashMap::new();
        for mut result in self.pending_results()? {
            let pre = files.get(result.path.as_str()).cloned().unwrap_or_default();
            match result.apply_replacements(&pre) {
                Ok(updated) => {
                    if result.removed_file {
                        files.remove(&result.path);
                    } else {
                        files.insert(result.path.clone(), updated);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %result.path, error = %err, "skipping unapplicable pending result");
                }
            }
        }
        Ok(files)
    }

    /// A newly loaded context for `path` invalidates pending builds on that
    /// path: mark them on their descriptions and drop the pending results.
    /// Unrelated paths keep their pending state.
    pub fn invalidate_conflicted_results(&self, loaded_paths: &[String]) -> AppResult<usize> {
        let mut invalidated = 0;

        for mut desc in self.load_descriptions()? {
            if desc.applied_at.is_some() || desc.error.is_some() {
                continue;
            }
            let mut changed = false;
            for op in &desc.operations {
                if loaded_paths.contains(&op.path)
                    && !desc.build_paths_invalidated.contains_key(&op.path)
                {
                    desc.build_paths_invalidated.insert(op.path.clone(), true);
                    changed = true;
                }
            }
            if changed {
                desc.updated_at = chrono::Utc::now();
                self.store_description(&desc)?;
            }
        }

        for result in self.pending_results()? {
            if loaded_paths.contains(&result.path) {
                self.delete_result(&result.id)?;
                invalidated += 1;
            }
        }

        Ok(invalidated)
    }

    // ── Summaries ──────────────────────────────────────────────────────

    pub fn store_summary(&self, summary: &ConvoSummary) -> AppResult<()> {
        let dir = self.plan_dir.join(SUMMARIES_DIR);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(dir.join(format!("{}.json", summary.id)), json)?;
        Ok(())
    }

    /// Summaries ordered by the message timestamp they cover.
    pub fn load_summaries(&self) -> AppResult<Vec<ConvoSummary>> {
        let dir = self.plan_dir.join(SUMMARIES_DIR);
        let mut summaries = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            summaries.push(serde_json::from_str::<ConvoSummary>(&raw)?);
        }
        summaries.sort_by(|a, b| {
            a.latest_convo_message_created_at
                .cmp(&b.latest_convo_message_created_at)
        });
        Ok(summaries)
    }

    // ── Settings / subtasks ────────────────────────────────────────────

    pub fn store_settings(&self, settings: &PlanSettings) -> AppResult<()> {
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(self.plan_dir.join(SETTINGS_FILE), json)?;
        Ok(())
    }

    pub fn load_settings(&self) -> AppResult<PlanSettings> {
        let path = self.plan_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(PlanSettings::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn store_subtasks(&self, subtasks: &[Subtask]) -> AppResult<()> {
        let json = serde_json::to_string_pretty(subtasks)?;
        std::fs::write(self.plan_dir.join(SUBTASKS_FILE), json)?;
        Ok(())
    }

    pub fn load_subtasks(&self) -> AppResult<Vec<Subtask>> {
        let path = self.plan_dir.join(SUBTASKS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn read_dir_or_empty(dir: &Path) -> AppResult<Vec<std::fs::DirEntry>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect::<Result<Vec<_>, _>>()?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Triple backticks are escaped in stored bodies so context files can be
/// safely embedded in markdown prompts.
fn escape_backticks(body: &str) -> String {
    body.replace("```", "\\`\\`\\`")
}

fn unescape_backticks(body: &str) -> String {
    body.replace("\\`\\`\\`", "```")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::context::ContextType;
    use chrono::Utc;
    use plandex_core::Operation;

    fn fs() -> (tempfile::TempDir, PlanFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = PlanFs::new(dir.path());
        fs.init().unwrap();
        (dir, fs)
    }

    fn file_context(path: &str, body: &str) -> Context {
        let mut ctx = Context::new(ContextType::File, path);
        ctx.file_path = path.into();
        ctx.set_body(body.into(), body.len() / 4);
        ctx
    }

    #[test]
    fn test_context_meta_and_body_files_exist() {
        let (_dir, fs) = fs();
        let ctx = file_context("src/main.rs", "fn main() {}");
        fs.store_context(&ctx).unwrap();

        assert!(fs.context_meta_path(&ctx.id).exists());
        assert!(fs.context_body_path(&ctx.id).exists());

        let meta_raw = std::fs::read_to_string(fs.context_meta_path(&ctx.id)).unwrap();
        assert!(!meta_raw.contains("fn main"));

        let loaded = fs.load_contexts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].body, "fn main() {}");
    }

    #[test]
    fn test_body_backticks_round_trip() {
        let (_dir, fs) = fs();
        let ctx = file_context("README.md", "```rust\nfn x() {}\n```");
        fs.store_context(&ctx).unwrap();

        let stored = std::fs::read_to_string(fs.context_body_path(&ctx.id)).unwrap();
        assert!(!stored.contains("```"));

        let loaded = fs.load_contexts().unwrap();
        assert_eq!(loaded[0].body, "```rust\nfn x() {}\n```");
    }

    #[test]
    fn test_delete_context_tolerates_missing() {
        let (_dir, fs) = fs();
        fs.delete_context("never-stored").unwrap();

        let ctx = file_context("a.rs", "x");
        fs.store_context(&ctx).unwrap();
        fs.delete_context(&ctx.id).unwrap();
        assert!(fs.load_contexts().unwrap().is_empty());
    }

    #[test]
    fn test_conversation_ordering() {
        let (_dir, fs) = fs();
        for num in [2usize, 1, 3] {
            let msg = ConvoMessage {
                id: format!("m{}", num),
                plan_id: "p1".into(),
                user_id: "u1".into(),
                role: "user".into(),
                num,
                tokens: 1,
                message: format!("msg {}", num),
                stopped: false,
                flags: Default::default(),
                reply_type: Default::default(),
                subtask: None,
                added_subtasks: vec![],
                removed_subtasks: vec![],
                activated_paths: Default::default(),
                activated_paths_ordered: vec![],
                created_at: Utc::now(),
            };
            fs.store_convo_message(&msg).unwrap();
        }

        let convo = fs.load_conversation().unwrap();
        let nums: Vec<usize> = convo.iter().map(|m| m.num).collect();
        assert_eq!(nums, vec![1, 2, 3]);
        assert_eq!(fs.next_message_num().unwrap(), 4);
    }

    #[test]
    fn test_pending_results_and_current_files() {
        let (_dir, fs) = fs();

        let mut new_file = PlanFileResult::new("p1", "b1", "m1", "hello.txt");
        new_file.content = "hi".into();
        fs.store_result(&new_file).unwrap();

        let mut applied = PlanFileResult::new("p1", "b2", "m1", "other.txt");
        applied.content = "done".into();
        applied.apply(Utc::now());
        fs.store_result(&applied).unwrap();

        let pending = fs.pending_results().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "hello.txt");

        let files = fs.current_plan_files().unwrap();
        assert_eq!(files.get("hello.txt").map(String::as_str), Some("hi"));
        assert!(!files.contains_key("other.txt"));
    }

    #[test]
    fn test_invalidate_conflicted_results() {
        let (_dir, fs) = fs();

        // pending build on foo.go recorded by description A
        let mut desc = ConvoMessageDescription {
            id: "descA".into(),
            plan_id: "p1".into(),
            convo_message_id: "m1".into(),
            summarized_to_message_id: String::new(),
            wrote_files: true,
            commit_msg: "update foo".into(),
            operations: vec![Operation::file("foo.go"), Operation::file("bar.go")],
            did_build: true,
            build_paths_invalidated: Default::default(),
            applied_at: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        fs.store_description(&desc).unwrap();

        let mut foo_res = PlanFileResult::new("p1", "b1", "m1", "foo.go");
        foo_res.content = "package main".into();
        fs.store_result(&foo_res).unwrap();
        let mut bar_res = PlanFileResult::new("p1", "b2", "m1", "bar.go");
        bar_res.content = "package main".into();
        fs.store_result(&bar_res).unwrap();

        let invalidated = fs
            .invalidate_conflicted_results(&["foo.go".to_string()])
            .unwrap();
        assert_eq!(invalidated, 1);

        desc = fs.load_descriptions().unwrap().remove(0);
        assert_eq!(desc.build_paths_invalidated.get("foo.go"), Some(&true));
        assert!(!desc.build_paths_invalidated.contains_key("bar.go"));

        // foo's pending result is gone, bar's survives
        let pending = fs.pending_results().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "bar.go");
    }

    #[test]
    fn test_settings_and_subtasks_round_trip() {
        let (_dir, fs) = fs();
        assert_eq!(fs.load_settings().unwrap(), PlanSettings::default());

        let mut subtasks = vec![Subtask::new("A"), Subtask::new("B")];
        subtasks[0].is_finished = true;
        fs.store_subtasks(&subtasks).unwrap();
        assert_eq!(fs.load_subtasks().unwrap(), subtasks);
    }

    #[test]
    fn test_summaries_sorted_by_covered_message_time() {
        let (_dir, fs) = fs();
        let base = Utc::now();
        for (id, offset) in [("s2", 10), ("s1", 5)] {
            fs.store_summary(&ConvoSummary {
                id: id.into(),
                plan_id: "p1".into(),
                latest_convo_message_id: id.into(),
                latest_convo_message_created_at: base + chrono::Duration::seconds(offset),
                summary: "sum".into(),
                tokens: 3,
                num_messages: 2,
                created_at: base,
            })
            .unwrap();
        }
        let summaries = fs.load_summaries().unwrap();
        assert_eq!(summaries[0].id, "s1");
        assert_eq!(summaries[1].id, "s2");
    }
}
