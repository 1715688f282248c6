//! Reply Parsing
//!
//! Incremental parsing of the assistant's streamed output into structured
//! file operations, plus the chunk processor that keeps partial control tags
//! out of the subscriber stream.

pub mod chunks;
pub mod parser;

pub use chunks::{BufferOrStreamResult, ChunkProcessor};
pub use parser::{ReplyParser, ReplyParserResult};
