//! Language Inference
//!
//! Maps file extensions to the grammar names the validator understands.

/// Check whether a grammar is available for the given language name.
pub fn is_language_supported(language: &str) -> bool {
    matches!(
        language,
        "python" | "rust" | "typescript" | "javascript" | "go" | "java"
    )
}

/// Infer the language of a file from its path extension.
///
/// Returns `None` for extensions without a grammar, which validates trivially.
pub fn infer_language(path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(path).extension()?.to_str()?;

    match ext {
        "py" | "pyi" => Some("python"),
        "rs" => Some("rust"),
        "ts" | "tsx" | "mts" | "cts" => Some("typescript"),
        "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
        "go" => Some("go"),
        "java" => Some("java"),
        _ => None,
    }
}
