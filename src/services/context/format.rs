//! Context Formatter
//!
//! Emits the context portion of the system message as ordered parts:
//!
//! - *basic*: cacheable preamble of directory trees, maps, notes, and URLs
//! - *auto*: planning phase file bodies (activated paths under auto-context,
//!   every file context otherwise)
//! - *smart*: implementation phase bodies for just the files the current
//!   subtask lists
//!
//! Skipped paths and removed files are reported as notices.

use std::collections::HashSet;
use std::sync::Arc;

use plandex_llm::estimate_tokens;

use crate::models::{Context, ContextType, CurrentStage, Subtask, TellStage};

pub struct ContextFormatParams<'a> {
    pub contexts: &'a [Arc<Context>],
    pub stage: CurrentStage,
    pub auto_context: bool,
    pub activated_paths: &'a HashSet<String>,
    pub current_subtask: Option<&'a Subtask>,
    pub skipped_paths: &'a HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FormattedContext {
    pub text: String,
    pub tokens: usize,
    /// Paths whose bodies made it into the message
    pub included_paths: Vec<String>,
}

/// Assemble the context text for the current stage.
pub fn format_model_context(params: ContextFormatParams<'_>) -> FormattedContext {
    let mut text = String::new();
    let mut included_paths = Vec::new();

    // basic part: everything that isn't a file body
    for context in params.contexts {
        match context.context_type {
            ContextType::DirectoryTree => {
                text.push_str(&format!(
                    "\n## Directory tree: {}\n\n{}\n",
                    context.name, context.body
                ));
            }
            ContextType::Map => {
                if !context.map_is_empty() {
                    text.push_str(&format!("\n## Project map: {}\n", context.name));
                    let mut paths: Vec<_> = context.map_parts.keys().collect();
                    paths.sort();
                    for path in paths {
                        let part = &context.map_parts[path];
                        if !part.trim().is_empty() {
                            text.push_str(&format!("\n### {}\n\n{}\n", path, part));
                        }
                    }
                }
            }
            ContextType::Note => {
                text.push_str(&format!("\n## Note: {}\n\n{}\n", context.name, context.body));
            }
            ContextType::Url => {
                text.push_str(&format!(
                    "\n## URL: {}\n\n{}\n",
                    context.url, context.body
                ));
            }
            ContextType::Image => {
                text.push_str(&format!("\n## Image attached: {}\n", context.name));
            }
            ContextType::File => {}
        }
    }

    // file bodies by stage
    let include_file = |context: &Context| -> bool {
        match params.stage.tell_stage {
            TellStage::Planning => {
                if params.auto_context {
                    params.activated_paths.contains(&context.file_path)
                } else {
                    true
                }
            }
            TellStage::Implementation => params
                .current_subtask
                .map(|t| t.uses_files.contains(&context.file_path))
                .unwrap_or(false),
        }
    };

    for context in params.contexts {
        if context.context_type != ContextType::File {
            continue;
        }
        if !include_file(context) {
            continue;
        }
        text.push_str(&format!(
            "\n## File: {}\n\n{}\n",
            context.file_path, context.body
        ));
        included_paths.push(context.file_path.clone());
    }

    if !params.skipped_paths.is_empty() {
        text.push_str("\n## Skipped files (do not write these)\n\n");
        let mut skipped: Vec<_> = params.skipped_paths.iter().collect();
        skipped.sort();
        for path in skipped {
            text.push_str(&format!("- {}\n", path));
        }
    }

    let tokens = estimate_tokens(&text);
    FormattedContext {
        text,
        tokens,
        included_paths,
    }
}
