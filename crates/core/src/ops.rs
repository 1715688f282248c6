//! Parsed File Operations
//!
//! A completed operation the model has declared on a single path. Operations
//! come out of the reply parser and feed the build pipeline.

use serde::{Deserialize, Serialize};

/// The kind of change an operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// Write or update the file at `path` with proposed content
    File,
    /// Move the file at `path` to `destination`
    Move,
    /// Remove the file at `path`
    Remove,
    /// Reset the file at `path` back to its context state
    Reset,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::File => write!(f, "file"),
            OperationType::Move => write!(f, "move"),
            OperationType::Remove => write!(f, "remove"),
            OperationType::Reset => write!(f, "reset"),
        }
    }
}

/// A model-declared intent affecting one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub path: String,
    /// Target path for move operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Prose the model wrote before the file block
    #[serde(default)]
    pub description: String,
    /// Proposed file content (file operations only)
    #[serde(default)]
    pub content: String,
    /// Streamed token count attributed to this operation
    #[serde(default)]
    pub num_tokens: usize,
}

impl Operation {
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(OperationType::File, path)
    }

    pub fn move_to(path: impl Into<String>, destination: impl Into<String>) -> Self {
        let mut op = Self::new(OperationType::Move, path);
        op.destination = Some(destination.into());
        op
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(OperationType::Remove, path)
    }

    pub fn reset(path: impl Into<String>) -> Self {
        Self::new(OperationType::Reset, path)
    }

    fn new(op_type: OperationType, path: impl Into<String>) -> Self {
        Self {
            op_type,
            path: path.into(),
            destination: None,
            description: String::new(),
            content: String::new(),
            num_tokens: 0,
        }
    }

    /// Human-readable name for logging.
    pub fn name(&self) -> String {
        match self.op_type {
            OperationType::Move => format!(
                "move {} -> {}",
                self.path,
                self.destination.as_deref().unwrap_or("?")
            ),
            OperationType::File => format!("file {}", self.path),
            OperationType::Remove => format!("remove {}", self.path),
            OperationType::Reset => format!("reset {}", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_tags() {
        let op = Operation::file("main.rs");
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        let parsed: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn test_move_operation_name() {
        let op = Operation::move_to("a.rs", "b.rs");
        assert_eq!(op.name(), "move a.rs -> b.rs");
        assert_eq!(op.destination.as_deref(), Some("b.rs"));
    }

    #[test]
    fn test_destination_omitted_when_none() {
        let op = Operation::remove("a.rs");
        let json = serde_json::to_string(&op).unwrap();
        assert!(!json.contains("destination"));
    }
}
