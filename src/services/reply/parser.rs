//! Reply Parser
//!
//! Line-incremental parser over the model's reply grammar. File contents are
//! wrapped in `<PlandexBlock lang="..." path="...">...</PlandexBlock>` tags;
//! move/remove/reset operations appear as markdown sections closed by
//! `<EndPlandexFileOps/>`. A path label line (e.g. `- file: src/main.rs`)
//! may precede a block, in which case it is held as a "maybe" path until the
//! opening tag confirms it.
//!
//! The parser is restartable: after a missing-file interruption the caller
//! constructs a fresh parser and replays the retained reply prefix.

use std::collections::HashSet;

use plandex_core::{Operation, OperationType, BLOCK_CLOSE_TAG, BLOCK_OPEN_PREFIX, END_FILE_OPS_TAG};
use regex::Regex;

const MOVE_SECTION: &str = "### Move Files";
const REMOVE_SECTION: &str = "### Remove Files";
const RESET_SECTION: &str = "### Reset Changes";

/// Snapshot of parser state after a chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyParserResult {
    pub maybe_file_path: String,
    pub current_file_path: String,
    pub is_in_move_block: bool,
    pub is_in_remove_block: bool,
    pub is_in_reset_block: bool,
    pub operations: Vec<Operation>,
    pub total_tokens: usize,
}

impl ReplyParserResult {
    pub fn file_operation_block_open(&self) -> bool {
        self.is_in_move_block || self.is_in_remove_block || self.is_in_reset_block
    }
}

pub struct ReplyParser {
    lines: Vec<String>,
    line_index: usize,
    maybe_file_path: String,
    current_file_path: String,
    current_file_operation: Option<Operation>,
    current_description_lines: Vec<String>,
    num_tokens: usize,
    operations: Vec<Operation>,
    pending_operations: Vec<Operation>,
    pending_paths: HashSet<String>,
    is_in_move_block: bool,
    is_in_remove_block: bool,
    is_in_reset_block: bool,
    path_attr_re: Regex,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
            line_index: 0,
            maybe_file_path: String::new(),
            current_file_path: String::new(),
            current_file_operation: None,
            current_description_lines: vec![String::new()],
            num_tokens: 0,
            operations: Vec::new(),
            pending_operations: Vec::new(),
            pending_paths: HashSet::new(),
            is_in_move_block: false,
            is_in_remove_block: false,
            is_in_reset_block: false,
            path_attr_re: Regex::new(r#"path="([^"]+)""#).expect("static regex"),
        }
    }

    /// Feed a chunk. `add_to_total` counts it toward the reply's token total
    /// (false when replaying a retained prefix).
    pub fn add_chunk(&mut self, chunk: &str, add_to_total: bool) {
        if add_to_total {
            self.num_tokens += 1;
        }
        if let Some(op) = &mut self.current_file_operation {
            op.num_tokens += 1;
        }

        let mut parts = chunk.split('\n');
        // first part extends the current line
        if let Some(first) = parts.next() {
            self.append_to_current_line(first);
        }
        // each subsequent part closes the previous line
        for part in parts {
            self.start_new_line(part);
            self.process_prev_full_line();
        }
    }

    fn append_to_current_line(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.lines[self.line_index].push_str(text);
        if self.current_file_operation.is_none() {
            if let Some(desc) = self.current_description_lines.last_mut() {
                desc.push_str(text);
            }
        }
    }

    fn start_new_line(&mut self, initial: &str) {
        self.lines.push(initial.to_string());
        self.line_index += 1;
        if self.current_file_operation.is_none() {
            self.current_description_lines.push(initial.to_string());
        }
    }

    fn process_prev_full_line(&mut self) {
        let prev_full_line = self.lines[self.line_index - 1].clone();
        let prev_trimmed = prev_full_line.trim().to_string();
        let in_op_block =
            self.is_in_move_block || self.is_in_remove_block || self.is_in_reset_block;

        if !self.maybe_file_path.is_empty() && !in_op_block {
            if prev_trimmed.starts_with(BLOCK_OPEN_PREFIX) {
                let path = self.maybe_file_path.clone();
                self.set_current_file(&path, false);
                return;
            } else if !prev_trimmed.is_empty() {
                // a non-empty line before the opening tag disproves the path
                self.maybe_file_path.clear();
            }
        }

        if self.current_file_path.is_empty() && !in_op_block {
            if line_has_xml_path(&prev_trimmed) {
                if let Some(path) = self.extract_xml_path(&prev_trimmed) {
                    self.set_current_file(&path, true);
                    return;
                }
            }

            let mut got_path = String::new();
            if line_maybe_has_file_path(&prev_trimmed) {
                got_path = extract_file_path(&prev_trimmed);
            } else if prev_trimmed == MOVE_SECTION {
                self.is_in_move_block = true;
            } else if prev_trimmed == REMOVE_SECTION {
                self.is_in_remove_block = true;
            } else if prev_trimmed == RESET_SECTION {
                self.is_in_reset_block = true;
            }

            if !got_path.is_empty() {
                self.maybe_file_path = got_path;
            }
        } else if !self.current_file_path.is_empty() {
            if prev_trimmed == BLOCK_CLOSE_TAG {
                if let Some(op) = self.current_file_operation.take() {
                    self.operations.push(op);
                }
                self.current_file_path.clear();
            } else if let Some(op) = &mut self.current_file_operation {
                op.content.push_str(&prev_full_line);
                op.content.push('\n');
            }
        } else if in_op_block {
            if prev_trimmed == END_FILE_OPS_TAG {
                self.is_in_move_block = false;
                self.is_in_remove_block = false;
                self.is_in_reset_block = false;
                self.operations.append(&mut self.pending_operations);
                self.pending_paths.clear();
            } else if self.is_in_move_block {
                if let Some(op) = extract_move_file(&prev_trimmed) {
                    if self.pending_paths.insert(op.path.clone()) {
                        self.pending_operations.push(op);
                    }
                }
            } else if self.is_in_remove_block {
                if let Some(op) = extract_listed_file(OperationType::Remove, &prev_trimmed) {
                    if self.pending_paths.insert(op.path.clone()) {
                        self.pending_operations.push(op);
                    }
                }
            } else if self.is_in_reset_block {
                if let Some(op) = extract_listed_file(OperationType::Reset, &prev_trimmed) {
                    if self.pending_paths.insert(op.path.clone()) {
                        self.pending_operations.push(op);
                    }
                }
            }
        }
    }

    fn set_current_file(&mut self, path: &str, no_label: bool) {
        self.current_file_path = path.to_string();
        let mut op = Operation::file(path);

        // drop the label line, blank separator, opening tag, and current
        // empty line from the accumulated description
        let skip_lines = if no_label { 2 } else { 4 };
        if self.current_description_lines.len() > skip_lines {
            let keep = self.current_description_lines.len() - skip_lines;
            let description = self.current_description_lines[..keep].join("\n");
            op.description = description.trim().to_string();
        }

        self.current_file_operation = Some(op);
        self.maybe_file_path.clear();
        self.current_description_lines = vec![String::new()];
    }

    fn extract_xml_path(&self, line: &str) -> Option<String> {
        self.path_attr_re
            .captures(line)
            .map(|c| c[1].to_string())
            .filter(|p| !p.is_empty())
    }

    pub fn read(&self) -> ReplyParserResult {
        ReplyParserResult {
            maybe_file_path: self.maybe_file_path.clone(),
            current_file_path: self.current_file_path.clone(),
            is_in_move_block: self.is_in_move_block,
            is_in_remove_block: self.is_in_remove_block,
            is_in_reset_block: self.is_in_reset_block,
            operations: self.operations.clone(),
            total_tokens: self.num_tokens,
        }
    }

    /// Force a final newline through the parser and read the result.
    pub fn finish_and_read(&mut self) -> ReplyParserResult {
        self.add_chunk("\n", false);
        self.read()
    }

    /// The reply up to (excluding) the label/tag line of the current path.
    pub fn reply_before_current_path(&self) -> String {
        self.reply_before_path(&self.current_file_path)
    }

    pub fn reply_before_path(&self, path: &str) -> String {
        if path.is_empty() {
            return self.lines.join("\n");
        }
        let idx = self
            .find_label_line(path)
            .or_else(|| self.find_tag_line(path))
            .unwrap_or(0);
        self.lines[..idx].join("\n")
    }

    /// The reply retained when a missing-file prompt interrupts: everything
    /// through the path's label line (and its trailing blank), or everything
    /// before the opening tag when the block had no label.
    pub fn reply_for_missing_file(&self) -> String {
        let path = &self.current_file_path;

        if let Some(idx) = self.find_label_line(path) {
            let end = idx + 2;
            if end > self.lines.len() - 1 {
                return self.lines.join("\n");
            }
            return format!("{}\n", self.lines[..end].join("\n"));
        }
        if let Some(idx) = self.find_tag_line(path) {
            return self.lines[..idx].join("\n");
        }
        self.lines.join("\n")
    }

    fn find_label_line(&self, path: &str) -> Option<usize> {
        self.lines.iter().enumerate().rev().find_map(|(i, line)| {
            let trimmed = line.trim();
            (line_maybe_has_file_path(trimmed) && extract_file_path(trimmed) == path)
                .then_some(i)
        })
    }

    fn find_tag_line(&self, path: &str) -> Option<usize> {
        self.lines.iter().enumerate().rev().find_map(|(i, line)| {
            let trimmed = line.trim();
            (line_has_xml_path(trimmed)
                && self.extract_xml_path(trimmed).as_deref() == Some(path))
            .then_some(i)
        })
    }
}

/// XML-style opening tag carrying its own path attribute.
pub fn line_has_xml_path(line: &str) -> bool {
    line.starts_with(BLOCK_OPEN_PREFIX) && line.contains("path=\"")
}

/// Markdown label lines that may announce the next file's path.
pub fn line_maybe_has_file_path(line: &str) -> bool {
    let could_be = line.starts_with('-')
        || line.starts_with("file:")
        || (line.starts_with("**") && line.ends_with("**"))
        || (line.starts_with('#') && line.ends_with(':'));

    if !could_be {
        return false;
    }

    let extracted = extract_file_path(line);
    let has_ext = extracted
        .rsplit('.')
        .next()
        .map(|ext| ext != extracted && !ext.contains(' '))
        .unwrap_or(false);
    let has_sep = extracted.contains('/');
    let has_spaces = extracted.contains(' ');

    !(!has_ext && !has_sep && has_spaces)
}

/// Strip markdown decoration from a label line to get the bare path.
pub fn extract_file_path(line: &str) -> String {
    let mut p = line.replace("**", "");
    p = p.replace('`', "").replace('\'', "").replace('"', "");
    p = p.trim_start_matches('-').to_string();
    for prefix in ["####", "###", "##", "#"] {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest.to_string();
            break;
        }
    }
    p = p.trim().to_string();
    for prefix in [
        "file:",
        "file path:",
        "filepath:",
        "File path:",
        "File Path:",
    ] {
        if let Some(rest) = p.strip_prefix(prefix) {
            p = rest.to_string();
            break;
        }
    }
    p = p.trim_end_matches(':').trim().to_string();

    if let Some((_, last)) = p.rsplit_once(": ") {
        p = last.to_string();
    }
    if let Some((first, _)) = p.split_once(" (") {
        p = first.to_string();
    }

    p
}

/// Parse a `- src → dst` move line.
fn extract_move_file(line: &str) -> Option<Operation> {
    let line = line.trim().strip_prefix('-')?.trim();
    let (src, dst) = line.split_once('→')?;
    let src = src.trim().trim_matches('`');
    let dst = dst.trim().trim_matches('`');
    if src.is_empty() || dst.is_empty() {
        return None;
    }
    Some(Operation::move_to(src, dst))
}

/// Parse a `- path` line in a remove/reset section.
fn extract_listed_file(op_type: OperationType, line: &str) -> Option<Operation> {
    let line = line.trim().strip_prefix('-')?.trim();
    let path = line.trim_matches('`');
    if path.is_empty() {
        return None;
    }
    match op_type {
        OperationType::Remove => Some(Operation::remove(path)),
        OperationType::Reset => Some(Operation::reset(path)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_REPLY: &str = "I'll create the main entry point.\n\n\
        - src/main.rs\n\n\
        <PlandexBlock lang=\"rust\" path=\"src/main.rs\">\n\
        fn main() {\n    println!(\"hi\");\n}\n\
        </PlandexBlock>\n\n\
        That's the entry point done.\n";

    #[test]
    fn test_single_file_block() {
        let mut parser = ReplyParser::new();
        parser.add_chunk(FILE_REPLY, true);
        let res = parser.finish_and_read();

        assert_eq!(res.operations.len(), 1);
        let op = &res.operations[0];
        assert_eq!(op.op_type, OperationType::File);
        assert_eq!(op.path, "src/main.rs");
        assert_eq!(op.content, "fn main() {\n    println!(\"hi\");\n}\n");
        assert!(op.description.contains("entry point"));
        assert_eq!(res.current_file_path, "");
    }

    #[test]
    fn test_chunking_invariance() {
        // feeding the same reply in any chunking yields the same operations
        // (token counts aside, which track chunk arrival)
        fn normalized(mut ops: Vec<Operation>) -> Vec<Operation> {
            for op in &mut ops {
                op.num_tokens = 0;
            }
            ops
        }

        let whole = {
            let mut p = ReplyParser::new();
            p.add_chunk(FILE_REPLY, true);
            normalized(p.finish_and_read().operations)
        };

        for chunk_size in [1usize, 2, 3, 7, 13] {
            let mut p = ReplyParser::new();
            let chars: Vec<char> = FILE_REPLY.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                p.add_chunk(&chunk.iter().collect::<String>(), true);
            }
            let ops = normalized(p.finish_and_read().operations);
            assert_eq!(ops, whole, "chunk size {} diverged", chunk_size);
        }
    }

    #[test]
    fn test_xml_path_without_label() {
        let reply = "Updating config.\n\n\
            <PlandexBlock lang=\"toml\" path=\"Cargo.toml\">\n\
            [package]\n\
            </PlandexBlock>\n";
        let mut parser = ReplyParser::new();
        parser.add_chunk(reply, true);
        let res = parser.finish_and_read();
        assert_eq!(res.operations.len(), 1);
        assert_eq!(res.operations[0].path, "Cargo.toml");
    }

    #[test]
    fn test_move_remove_reset_sections() {
        let reply = "### Move Files\n\
            - `src/old.rs` → `src/new.rs`\n\
            <EndPlandexFileOps/>\n\
            ### Remove Files\n\
            - `tmp/scratch.rs`\n\
            <EndPlandexFileOps/>\n\
            ### Reset Changes\n\
            - `src/main.rs`\n\
            <EndPlandexFileOps/>\n";
        let mut parser = ReplyParser::new();
        parser.add_chunk(reply, true);
        let res = parser.finish_and_read();

        assert_eq!(res.operations.len(), 3);
        assert_eq!(res.operations[0].op_type, OperationType::Move);
        assert_eq!(res.operations[0].path, "src/old.rs");
        assert_eq!(res.operations[0].destination.as_deref(), Some("src/new.rs"));
        assert_eq!(res.operations[1].op_type, OperationType::Remove);
        assert_eq!(res.operations[1].path, "tmp/scratch.rs");
        assert_eq!(res.operations[2].op_type, OperationType::Reset);
        assert_eq!(res.operations[2].path, "src/main.rs");
    }

    #[test]
    fn test_duplicate_paths_in_section_dedupe() {
        let reply = "### Remove Files\n- `a.rs`\n- `a.rs`\n<EndPlandexFileOps/>\n";
        let mut parser = ReplyParser::new();
        parser.add_chunk(reply, true);
        assert_eq!(parser.finish_and_read().operations.len(), 1);
    }

    #[test]
    fn test_maybe_path_disproved_by_text() {
        let reply = "- src/main.rs\n\nActually, let me explain first.\n";
        let mut parser = ReplyParser::new();
        parser.add_chunk(reply, true);
        let res = parser.finish_and_read();
        assert_eq!(res.current_file_path, "");
        assert_eq!(res.maybe_file_path, "");
        assert!(res.operations.is_empty());
    }

    #[test]
    fn test_current_file_path_mid_block() {
        let mut parser = ReplyParser::new();
        parser.add_chunk(
            "- src/lib.rs\n\n<PlandexBlock lang=\"rust\" path=\"src/lib.rs\">\npub fn x() {}\n",
            true,
        );
        let res = parser.read();
        assert_eq!(res.current_file_path, "src/lib.rs");
        assert!(res.operations.is_empty());
    }

    #[test]
    fn test_reply_for_missing_file_keeps_prefix() {
        let mut parser = ReplyParser::new();
        parser.add_chunk(
            "Intro text.\n\n- secrets.env\n\n<PlandexBlock lang=\"bash\" path=\"secrets.env\">\nSECRET=1\n",
            true,
        );
        let prefix = parser.reply_for_missing_file();
        assert!(prefix.contains("Intro text."));
        assert!(prefix.contains("- secrets.env"));
        assert!(!prefix.contains("SECRET=1"));
    }

    #[test]
    fn test_extract_file_path_variants() {
        assert_eq!(extract_file_path("- `src/main.rs`"), "src/main.rs");
        assert_eq!(extract_file_path("**src/main.rs**"), "src/main.rs");
        assert_eq!(extract_file_path("### src/main.rs:"), "src/main.rs");
        assert_eq!(extract_file_path("- file: src/main.rs"), "src/main.rs");
        assert_eq!(
            extract_file_path("- src/main.rs (new file)"),
            "src/main.rs"
        );
    }

    #[test]
    fn test_line_maybe_has_file_path_rejects_prose() {
        assert!(!line_maybe_has_file_path("- this is a bullet point"));
        assert!(line_maybe_has_file_path("- src/main.rs"));
        assert!(line_maybe_has_file_path("- Makefile.am"));
    }

    #[test]
    fn test_token_counting() {
        let mut parser = ReplyParser::new();
        parser.add_chunk("a", true);
        parser.add_chunk("b", true);
        parser.add_chunk("c", false);
        assert_eq!(parser.read().total_tokens, 2);
    }
}
