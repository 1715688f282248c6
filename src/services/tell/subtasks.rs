//! Reply Checks
//!
//! Post-stream scans over the finished reply: task list parsing, removed
//! tasks, auto-load context requests, and follow-up context clearing.

use std::collections::HashSet;

use regex::Regex;

use crate::models::Subtask;

/// Parse subtasks from a `### Tasks` section: numbered titles with optional
/// description lines and `Uses:` file lists.
pub fn parse_subtasks(reply: &str) -> Vec<Subtask> {
    let section = reply
        .split("### Tasks")
        .nth(1)
        .or_else(|| reply.split("### Task").nth(1));
    let Some(section) = section else {
        return Vec::new();
    };

    let numbered = Regex::new(r"^\d+\.\s").expect("static regex");

    let mut subtasks: Vec<Subtask> = Vec::new();
    let mut current: Option<Subtask> = None;
    let mut desc_lines: Vec<String> = Vec::new();

    let mut push_current = |current: &mut Option<Subtask>, desc_lines: &mut Vec<String>| {
        if let Some(mut task) = current.take() {
            task.description = desc_lines.join("\n");
            desc_lines.clear();
            subtasks.push(task);
        }
    };

    for line in section.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if numbered.is_match(line) {
            push_current(&mut current, &mut desc_lines);
            if let Some((_, title)) = line.split_once(". ") {
                current = Some(Subtask::new(title.trim()));
            }
            continue;
        }

        if let Some(uses) = line.strip_prefix("Uses:") {
            if let Some(task) = &mut current {
                for file in uses.split(',') {
                    let file = file.trim().trim_matches('`');
                    if !file.is_empty() {
                        task.uses_files.push(file.to_string());
                    }
                }
            }
            continue;
        }

        if current.is_some() {
            let line = line.trim_start_matches('-').trim();
            if !line.is_empty() {
                desc_lines.push(line.to_string());
            }
        }
    }
    push_current(&mut current, &mut desc_lines);

    subtasks
}

/// Parse titles from a `### Remove Tasks` section.
pub fn parse_remove_subtasks(reply: &str) -> Vec<String> {
    let Some(section) = reply.split("### Remove Tasks").nth(1) else {
        return Vec::new();
    };

    let mut titles = Vec::new();
    let mut saw_empty = false;
    for line in section.lines() {
        let line = line.trim();
        if line.is_empty() {
            saw_empty = true;
            continue;
        }
        if saw_empty && !line.starts_with('-') {
            break;
        }
        if let Some(title) = line.strip_prefix("- ") {
            let title = title.trim();
            if !title.is_empty() {
                titles.push(title.to_string());
            }
        }
    }
    titles
}

/// Result of scanning for a `### Load Context` section.
#[derive(Debug, Clone, Default)]
pub struct AutoLoadContextResult {
    /// Project paths the reply asked to load, in reply order
    pub auto_load_paths: Vec<String>,
    /// Paths mentioned that are already active (kept activated)
    pub activated_paths: Vec<String>,
}

/// Scan the reply for a `### Load Context` list of backticked project paths.
pub fn check_auto_load_context(
    reply: &str,
    project_paths: &HashSet<String>,
    loaded_paths: &HashSet<String>,
) -> AutoLoadContextResult {
    let Some(section) = reply.split("### Load Context").nth(1) else {
        return AutoLoadContextResult::default();
    };

    let mut result = AutoLoadContextResult::default();
    let mut seen = HashSet::new();
    let mut saw_list = false;

    for line in section.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(item) = line.strip_prefix('-') else {
            if saw_list {
                break;
            }
            continue;
        };
        saw_list = true;

        let path = item.trim().trim_matches('`').to_string();
        if path.is_empty() || !project_paths.contains(&path) || !seen.insert(path.clone()) {
            continue;
        }
        if loaded_paths.contains(&path) {
            result.activated_paths.push(path);
        } else {
            result.auto_load_paths.push(path);
        }
    }

    result
}

/// Whether a follow-up reply asked to restart from the context phase.
pub fn follow_up_needs_context(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    lower.contains("clear all context") || lower.contains("decide what context i need")
}
