//! Contexts
//!
//! Input artifacts attached to a plan: files, directory trees, URLs, maps,
//! images, and notes. The body is stored separately from the metadata record
//! and never appears inside it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Closed set of context kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    File,
    DirectoryTree,
    Url,
    Map,
    Image,
    Note,
}

/// Context metadata. Persisted as `<id>.meta`; the body lives in `<id>.body`
/// and map sub-parts in `<id>.map-parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: String,
    pub context_type: ContextType,
    pub name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub url: String,
    /// SHA-256 of the body at load time
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub num_tokens: usize,
    #[serde(default)]
    pub body_size: usize,
    #[serde(default)]
    pub auto_loaded: bool,
    /// Map contexts only: per-path token counts
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub map_tokens: HashMap<String, usize>,
    /// Map contexts only: per-path shas
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub map_shas: HashMap<String, String>,
    /// Map contexts only: per-path body sizes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub map_sizes: HashMap<String, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Body, loaded on demand; never serialized into the meta record
    #[serde(skip)]
    pub body: String,
    /// Map sub-parts keyed by path, loaded on demand
    #[serde(skip)]
    pub map_parts: HashMap<String, String>,
}

impl Context {
    pub fn new(context_type: ContextType, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_type,
            name: name.into(),
            file_path: String::new(),
            url: String::new(),
            sha: String::new(),
            num_tokens: 0,
            body_size: 0,
            auto_loaded: false,
            map_tokens: HashMap::new(),
            map_shas: HashMap::new(),
            map_sizes: HashMap::new(),
            created_at: now,
            updated_at: now,
            body: String::new(),
            map_parts: HashMap::new(),
        }
    }

    /// Attach a body, updating sha/size/token metadata together.
    pub fn set_body(&mut self, body: String, num_tokens: usize) {
        self.sha = sha256_hex(&body);
        self.body_size = body.len();
        self.num_tokens = num_tokens;
        self.body = body;
        self.updated_at = Utc::now();
    }

    pub fn is_map(&self) -> bool {
        self.context_type == ContextType::Map
    }

    /// A map is empty when it has no sub-parts with content.
    pub fn map_is_empty(&self) -> bool {
        self.map_parts.values().all(|p| p.trim().is_empty())
    }
}

/// Hex-encoded SHA-256 of a body.
pub fn sha256_hex(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_type_serialization() {
        let json = serde_json::to_string(&ContextType::DirectoryTree).unwrap();
        assert_eq!(json, "\"directory-tree\"");
    }

    #[test]
    fn test_body_never_in_meta() {
        let mut ctx = Context::new(ContextType::File, "main.rs");
        ctx.file_path = "src/main.rs".into();
        ctx.set_body("fn main() {}".into(), 5);

        let meta = serde_json::to_string(&ctx).unwrap();
        assert!(!meta.contains("fn main"));
        assert!(meta.contains(&ctx.sha));

        let parsed: Context = serde_json::from_str(&meta).unwrap();
        assert_eq!(parsed.body, "");
        assert_eq!(parsed.body_size, 12);
    }

    #[test]
    fn test_set_body_updates_sha() {
        let mut ctx = Context::new(ContextType::File, "a.rs");
        ctx.set_body("one".into(), 1);
        let first = ctx.sha.clone();
        ctx.set_body("two".into(), 1);
        assert_ne!(first, ctx.sha);
    }

    #[test]
    fn test_map_is_empty() {
        let mut ctx = Context::new(ContextType::Map, "map");
        assert!(ctx.map_is_empty());
        ctx.map_parts.insert("src/a.rs".into(), "fn a()".into());
        assert!(!ctx.map_is_empty());
    }
}
