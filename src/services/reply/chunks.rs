//! Chunk Processor
//!
//! Sits between the model stream and subscribers, buffering output that
//! straddles control tokens so subscribers never see a partial tag.
//!
//! Release conditions:
//! - a partial `<PlandexBlock ...>` completes: emit ` ```<lang> `
//! - a partial `</PlandexBlock>` completes: emit ` ``` `
//! - a partial `<EndPlandexFileOps/>` completes: drop the tag
//! - up to two trailing backticks are held until a third arrives (escape)
//!   or a non-backtick arrives (release unchanged)
//!
//! Manual stop sequences are scanned first: content after one is never
//! streamed, and a chunk ending with a stop-sequence prefix is held back.

use plandex_core::{Operation, BLOCK_CLOSE_TAG, END_FILE_OPS_TAG};
use regex::Regex;

use super::parser::ReplyParserResult;
use crate::models::TellStage;

const OPEN_TAG_HEAD: &str = "PlandexBlock lang=\"";

/// Outcome of processing one content chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferOrStreamResult {
    pub should_stream: bool,
    pub content: String,
    pub block_lang: String,
    pub should_stop: bool,
}

/// Stateful filter over streamed reply content.
pub struct ChunkProcessor {
    pub chunks_received: usize,
    /// Operations already handed to the build pipeline
    pub reply_operations: Vec<Operation>,
    content_buffer: String,
    awaiting_block_opening_tag: bool,
    awaiting_block_closing_tag: bool,
    awaiting_op_closing_tag: bool,
    awaiting_backticks: bool,
    pub file_open: bool,
    opening_tag_re: Regex,
}

impl Default for ChunkProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkProcessor {
    pub fn new() -> Self {
        Self {
            chunks_received: 0,
            reply_operations: Vec::new(),
            content_buffer: String::new(),
            awaiting_block_opening_tag: false,
            awaiting_block_closing_tag: false,
            awaiting_op_closing_tag: false,
            awaiting_backticks: false,
            file_open: false,
            opening_tag_re: Regex::new(r#"<PlandexBlock\s+lang="(.+?)"\s+path="(.+?)".*?>"#)
                .expect("static regex"),
        }
    }

    /// Keep `file_open` in step with the parser before filtering a chunk.
    ///
    /// Returns the parser snapshot to filter against; when the reply just
    /// closed a block, the parser is flushed so the snapshot reflects the
    /// completed operation.
    pub fn sync_file_state(
        &mut self,
        parser: &mut super::parser::ReplyParser,
        reply_so_far: &str,
        chunk: &str,
    ) -> ReplyParserResult {
        let mut res = parser.read();

        if !self.file_open && !res.current_file_path.is_empty() {
            self.file_open = true;
        }
        if self.file_open && format!("{}{}", reply_so_far, chunk).ends_with(BLOCK_CLOSE_TAG) {
            res = parser.finish_and_read();
            self.file_open = false;
        }
        if self.file_open && res.current_file_path.is_empty() {
            self.file_open = false;
        }

        res
    }

    /// Decide whether to stream `content` now, hold it, or stop the stream.
    pub fn buffer_or_stream(
        &mut self,
        content: &str,
        parser_res: &ReplyParserResult,
        stage: TellStage,
        stop_sequences: &[String],
    ) -> BufferOrStreamResult {
        if let Some(res) = self.check_stop_sequences(content, stop_sequences) {
            return res;
        }

        // apart from stop sequences, no buffering in the planning stage
        if stage == TellStage::Planning {
            return BufferOrStreamResult {
                should_stream: true,
                content: content.to_string(),
                ..Default::default()
            };
        }

        let mut content = content.to_string();
        let mut should_stream = false;
        let mut block_lang = String::new();

        let awaiting_tag = self.awaiting_block_opening_tag
            || self.awaiting_block_closing_tag
            || self.awaiting_op_closing_tag;
        let awaiting_any = awaiting_tag || self.awaiting_backticks;

        if awaiting_any {
            self.content_buffer.push_str(&content);
            content = std::mem::take(&mut self.content_buffer);
        }

        if self.awaiting_backticks {
            if content.contains("```") {
                self.awaiting_backticks = false;
                content = content.replace("```", "\\`\\`\\`");
                if !(self.awaiting_block_opening_tag || self.awaiting_block_closing_tag) {
                    should_stream = true;
                }
            } else if !content.ends_with('`') {
                // fewer than 3 backticks, nothing to escape
                self.awaiting_backticks = false;
                if !(self.awaiting_block_opening_tag || self.awaiting_block_closing_tag) {
                    should_stream = true;
                }
            }
        }

        if awaiting_tag {
            if self.awaiting_block_opening_tag {
                let mut matched_prefix = false;

                if !parser_res.current_file_path.is_empty() {
                    let (matched, replaced, lang) = self.replace_opening_tag(&content);
                    if matched {
                        should_stream = true;
                        self.awaiting_block_opening_tag = false;
                        self.file_open = true;
                        block_lang = lang;
                        content = replaced;
                    } else {
                        // tag is missing even though a file opened; recover
                        tracing::warn!("opening PlandexBlock tag missing; recovering");
                        self.awaiting_block_opening_tag = false;
                        self.file_open = false;
                        content.push_str("\n```");
                        should_stream = true;
                    }
                } else if let Some(last) = content.rsplit('<').next() {
                    if content.contains('<')
                        && (OPEN_TAG_HEAD.starts_with(last) || last.starts_with(OPEN_TAG_HEAD))
                    {
                        matched_prefix = true;
                    }
                }

                if !matched_prefix
                    && parser_res.maybe_file_path.is_empty()
                    && parser_res.current_file_path.is_empty()
                {
                    // wasn't really a file path / code block
                    self.awaiting_block_opening_tag = false;
                    should_stream = true;
                }
            } else if self.awaiting_block_closing_tag {
                if parser_res.current_file_path.is_empty() {
                    if content.contains(BLOCK_CLOSE_TAG) {
                        should_stream = true;
                        self.awaiting_block_closing_tag = false;
                        self.file_open = false;
                        content = content.replace(BLOCK_CLOSE_TAG, "```");
                    } else {
                        tracing::warn!("closing PlandexBlock tag missing; recovering");
                        self.awaiting_block_closing_tag = false;
                        should_stream = true;
                    }
                }
            } else if self.awaiting_op_closing_tag && content.contains(END_FILE_OPS_TAG) {
                self.awaiting_op_closing_tag = false;
                content = content.replacen(&format!("\n{}", END_FILE_OPS_TAG), "", 1);
                content = content.replacen(END_FILE_OPS_TAG, "", 1);
                should_stream = true;
            }
        } else {
            if !parser_res.maybe_file_path.is_empty() && parser_res.current_file_path.is_empty() {
                self.awaiting_block_opening_tag = true;
            } else if let Some(last) = content.rsplit('<').next() {
                if content.contains('<')
                    && (OPEN_TAG_HEAD.starts_with(last) || last.starts_with(OPEN_TAG_HEAD))
                {
                    self.awaiting_block_opening_tag = true;
                }
            }

            if !parser_res.current_file_path.is_empty() {
                if content.contains(BLOCK_CLOSE_TAG) {
                    self.awaiting_block_closing_tag = true;
                } else if let Some(last) = content.rsplit('<').next() {
                    if content.contains('<') && "/PlandexBlock>".starts_with(last) {
                        self.awaiting_block_closing_tag = true;
                    }
                }
            } else if parser_res.file_operation_block_open() {
                if content.contains(END_FILE_OPS_TAG) {
                    self.awaiting_op_closing_tag = true;
                } else if let Some(last) = content.rsplit('<').next() {
                    if content.contains('<') && "EndPlandexFileOps/>".starts_with(last) {
                        self.awaiting_op_closing_tag = true;
                    }
                }
            } else if content.contains(BLOCK_CLOSE_TAG) {
                content = content.replacen(BLOCK_CLOSE_TAG, "```", 1);
            } else if content.contains(END_FILE_OPS_TAG) {
                content = content.replacen(&format!("\n{}", END_FILE_OPS_TAG), "", 1);
                content = content.replacen(END_FILE_OPS_TAG, "", 1);
            }

            if self.file_open && (content.contains("```") || content.ends_with('`')) {
                self.awaiting_backticks = true;
            }

            if self.file_open {
                let (matched, replaced, lang) = self.replace_opening_tag(&content);
                if matched {
                    self.awaiting_block_opening_tag = false;
                    block_lang = lang;
                    content = replaced;
                }
            }

            should_stream = !self.awaiting_block_opening_tag
                && !self.awaiting_block_closing_tag
                && !self.awaiting_op_closing_tag
                && !self.awaiting_backticks;
        }

        if should_stream {
            self.content_buffer.clear();
        } else {
            self.content_buffer = content.clone();
        }

        BufferOrStreamResult {
            should_stream,
            content,
            block_lang,
            should_stop: false,
        }
    }

    fn check_stop_sequences(
        &mut self,
        content: &str,
        stop_sequences: &[String],
    ) -> Option<BufferOrStreamResult> {
        for stop in stop_sequences {
            // whole stop sequence in this chunk: stream what precedes it, stop
            if let Some((before, _)) = content.split_once(stop.as_str()) {
                return Some(BufferOrStreamResult {
                    should_stream: !before.is_empty(),
                    content: before.to_string(),
                    should_stop: true,
                    ..Default::default()
                });
            }

            // stop sequence straddles buffer + chunk: nothing left to stream
            let combined = format!("{}{}", self.content_buffer, content);
            if combined.contains(stop.as_str()) {
                return Some(BufferOrStreamResult {
                    should_stream: false,
                    should_stop: true,
                    ..Default::default()
                });
            }

            // chunk ends with a prefix of the stop sequence: hold and wait
            let window_start = combined.len().saturating_sub(stop.len() - 1);
            let ends_with_stop_prefix = combined
                .char_indices()
                .map(|(idx, _)| idx)
                .filter(|idx| *idx >= window_start)
                .any(|idx| stop.starts_with(&combined[idx..]));
            if ends_with_stop_prefix {
                self.content_buffer.push_str(content);
                return Some(BufferOrStreamResult {
                    should_stream: false,
                    content: content.to_string(),
                    ..Default::default()
                });
            }
        }
        None
    }

    fn replace_opening_tag(&self, content: &str) -> (bool, String, String) {
        if let Some(caps) = self.opening_tag_re.captures(content) {
            let lang = caps[1].to_string();
            let whole = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
            let replaced = content.replacen(&whole, &format!("```{}", lang), 1);
            return (true, replaced, lang);
        }
        if content.contains("<PlandexBlock>") {
            return (
                true,
                content.replacen("<PlandexBlock>", "```", 1),
                String::new(),
            );
        }
        (false, String::new(), String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reply::parser::ReplyParser;
    use crate::models::TellStage;

    fn run_stream(chunks: &[&str], stage: TellStage) -> String {
        let mut parser = ReplyParser::new();
        let mut processor = ChunkProcessor::new();
        let mut out = String::new();
        let mut reply = String::new();

        for chunk in chunks {
            parser.add_chunk(chunk, true);
            let res = processor.sync_file_state(&mut parser, &reply, chunk);
            reply.push_str(chunk);
            let stream_res = processor.buffer_or_stream(chunk, &res, stage, &[]);
            if stream_res.should_stream {
                out.push_str(&stream_res.content);
            }
            if stream_res.should_stop {
                break;
            }
        }
        out
    }

    #[test]
    fn test_planning_stage_streams_everything() {
        let out = run_stream(&["plain ", "text ", "reply"], TellStage::Planning);
        assert_eq!(out, "plain text reply");
    }

    #[test]
    fn test_opening_tag_becomes_markdown_fence() {
        let out = run_stream(
            &[
                "- src/main.rs\n\n",
                "<PlandexBlock lang=\"rust\" path=\"src/main.rs\">\n",
                "fn main() {}\n",
            ],
            TellStage::Implementation,
        );
        assert!(out.contains("```rust"), "got: {:?}", out);
        assert!(!out.contains("<PlandexBlock"), "got: {:?}", out);
        assert!(out.contains("fn main() {}"));
    }

    #[test]
    fn test_split_opening_tag_is_buffered() {
        let out = run_stream(
            &[
                "- src/main.rs\n\n",
                "<Plandex",
                "Block lang=\"ru",
                "st\" path=\"src/main.rs\">\n",
                "fn main() {}\n",
            ],
            TellStage::Implementation,
        );
        assert!(out.contains("```rust"), "got: {:?}", out);
        assert!(!out.contains("<Plandex"), "got: {:?}", out);
    }

    #[test]
    fn test_closing_tag_becomes_fence(){
        let out = run_stream(
            &[
                "- a.rs\n\n<PlandexBlock lang=\"rust\" path=\"a.rs\">\n",
                "fn a() {}\n",
                "</PlandexBlock>\n",
            ],
            TellStage::Implementation,
        );
        assert!(out.contains("```rust"));
        assert!(out.trim_end().ends_with("```"), "got: {:?}", out);
        assert!(!out.contains("</PlandexBlock>"));
    }

    #[test]
    fn test_end_file_ops_tag_is_dropped() {
        let out = run_stream(
            &[
                "### Remove Files\n",
                "- `tmp.rs`\n",
                "<EndPlandexFileOps/>\n",
            ],
            TellStage::Implementation,
        );
        assert!(!out.contains("EndPlandexFileOps"), "got: {:?}", out);
        assert!(out.contains("### Remove Files"));
    }

    #[test]
    fn test_stop_sequence_stops_stream() {
        let mut parser = ReplyParser::new();
        let mut processor = ChunkProcessor::new();
        parser.add_chunk("done now", true);
        let res = parser.read();
        let stop = vec!["<PlandexFinish/>".to_string()];

        let out = processor.buffer_or_stream(
            "done now<PlandexFinish/>ignored",
            &res,
            TellStage::Planning,
            &stop,
        );
        assert!(out.should_stop);
        assert!(out.should_stream);
        assert_eq!(out.content, "done now");
    }

    #[test]
    fn test_stop_sequence_prefix_is_held() {
        let mut parser = ReplyParser::new();
        let mut processor = ChunkProcessor::new();
        parser.add_chunk("text ", true);
        let res = parser.read();
        let stop = vec!["<PlandexFinish/>".to_string()];

        let out = processor.buffer_or_stream("text <Plandex", &res, TellStage::Planning, &stop);
        assert!(!out.should_stream);
        assert!(!out.should_stop);
    }

    #[test]
    fn test_backtick_escaping_inside_block() {
        let out = run_stream(
            &[
                "- doc.md\n\n<PlandexBlock lang=\"markdown\" path=\"doc.md\">\n",
                "```",
                "js\ncode\n",
            ],
            TellStage::Implementation,
        );
        assert!(out.contains("\\`\\`\\`js"), "got: {:?}", out);
    }

    #[test]
    fn test_two_trailing_backticks_released_on_non_backtick() {
        let out = run_stream(
            &[
                "- doc.md\n\n<PlandexBlock lang=\"markdown\" path=\"doc.md\">\n",
                "``",
                "x\n",
            ],
            TellStage::Implementation,
        );
        assert!(out.contains("``x"), "got: {:?}", out);
        assert!(!out.contains("\\`"), "got: {:?}", out);
    }
}
