//! Syntax Validation
//!
//! Language-aware syntax checking for built file results using tree-sitter
//! grammars. Supports Rust, Python, TypeScript, JavaScript, Go, and Java and
//! falls back gracefully when a language is not supported: files without a
//! parser validate trivially with `has_parser = false`.
//!
//! The build pipeline treats this crate as a black box returning
//! `{has_parser, timed_out, valid, errors[]}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod language;

pub use language::{infer_language, is_language_supported};

/// Parses slower than this are abandoned; a timed-out check never fails a build.
const PARSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a syntax validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Whether a grammar exists for the file's language
    pub has_parser: bool,
    /// Whether the parse exceeded the time budget
    pub timed_out: bool,
    /// Whether the content parsed without errors
    pub valid: bool,
    /// Human-readable error locations, one per syntax error
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// A check is worth repeating after edits only if a parser ran to completion.
    pub fn will_check_syntax(&self) -> bool {
        self.has_parser && !self.timed_out
    }

    fn no_parser() -> Self {
        Self {
            has_parser: false,
            timed_out: false,
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Validate `content` as the language inferred from `path`'s extension.
///
/// Runs the parse on a blocking thread under a timeout so a pathological
/// input can't stall a build worker.
pub async fn validate(path: &str, content: &str) -> ValidationResult {
    let Some(lang) = infer_language(path) else {
        return ValidationResult::no_parser();
    };

    let content = content.to_string();
    let lang_owned = lang.to_string();

    let parse = tokio::task::spawn_blocking(move || validate_sync(&lang_owned, &content));

    match tokio::time::timeout(PARSE_TIMEOUT, parse).await {
        Ok(Ok(res)) => res,
        Ok(Err(join_err)) => {
            tracing::warn!(path, error = %join_err, "syntax validation task failed");
            ValidationResult::no_parser()
        }
        Err(_) => {
            tracing::warn!(path, lang, "syntax validation timed out");
            ValidationResult {
                has_parser: true,
                timed_out: true,
                valid: true,
                errors: Vec::new(),
            }
        }
    }
}

/// Synchronous validation against a named language grammar.
pub fn validate_sync(language: &str, content: &str) -> ValidationResult {
    let lang: tree_sitter::Language = match language {
        "python" => tree_sitter_python::LANGUAGE.into(),
        "rust" => tree_sitter_rust::LANGUAGE.into(),
        "typescript" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        "javascript" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        "go" => tree_sitter_go::LANGUAGE.into(),
        "java" => tree_sitter_java::LANGUAGE.into(),
        _ => return ValidationResult::no_parser(),
    };

    let mut parser = tree_sitter::Parser::new();
    if parser.set_language(&lang).is_err() {
        return ValidationResult::no_parser();
    }

    let Some(tree) = parser.parse(content, None) else {
        // tree-sitter returned nothing; treat as no parser rather than invalid
        return ValidationResult::no_parser();
    };

    let mut errors = Vec::new();
    collect_errors(tree.root_node(), content, &mut errors);

    ValidationResult {
        has_parser: true,
        timed_out: false,
        valid: errors.is_empty(),
        errors,
    }
}

fn collect_errors(node: tree_sitter::Node, source: &str, errors: &mut Vec<String>) {
    if !node.has_error() {
        return;
    }

    if node.is_error() || node.is_missing() {
        let start = node.start_position();
        let snippet: String = source
            .get(node.byte_range())
            .unwrap_or("")
            .chars()
            .take(60)
            .collect();
        let kind = if node.is_missing() { "missing" } else { "error" };
        errors.push(format!(
            "{} at line {}, column {}: {:?}",
            kind,
            start.row + 1,
            start.column + 1,
            snippet
        ));
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_errors(child, source, errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_rust() {
        let res = validate("src/main.rs", "fn main() { println!(\"hi\"); }").await;
        assert!(res.has_parser);
        assert!(res.valid);
        assert!(res.errors.is_empty());
        assert!(res.will_check_syntax());
    }

    #[tokio::test]
    async fn test_invalid_rust() {
        let res = validate("src/main.rs", "fn main( {").await;
        assert!(res.has_parser);
        assert!(!res.valid);
        assert!(!res.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_extension() {
        let res = validate("notes.txt", "anything goes").await;
        assert!(!res.has_parser);
        assert!(res.valid);
        assert!(!res.will_check_syntax());
    }

    #[test]
    fn test_validate_sync_python() {
        let res = validate_sync("python", "def f():\n    return 1\n");
        assert!(res.valid);

        let res = validate_sync("python", "def f(:\n");
        assert!(!res.valid);
    }

    #[test]
    fn test_error_reports_location() {
        let res = validate_sync("go", "package main\nfunc f( {\n");
        assert!(!res.valid);
        assert!(res.errors[0].contains("line"));
    }
}
