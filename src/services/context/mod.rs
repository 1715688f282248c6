//! Context Formatting & Summaries
//!
//! Token-budget-aware assembly of model context and the rolling conversation
//! summary window.

pub mod format;
pub mod summary;

pub use format::{format_model_context, ContextFormatParams, FormattedContext};
pub use summary::{plan_conversation, ConvoPlan};
