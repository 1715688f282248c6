//! Diff to Replacements
//!
//! Converts an original/updated file pair into an ordered list of
//! `Replacement`s whose sequential application reproduces the updated
//! content exactly. Replacements are anchored with enough preceding context
//! to make first-occurrence substitution unambiguous; if anchoring cannot be
//! made exact, a single whole-file replacement is emitted instead.

use similar::{ChangeTag, TextDiff};

use crate::models::Replacement;

/// Unified diff text for prompts.
pub fn unified_diff(original: &str, updated: &str) -> String {
    TextDiff::from_lines(original, updated)
        .unified_diff()
        .context_radius(2)
        .to_string()
}

/// Ordered replacements transforming `original` into `updated`.
pub fn diff_replacements(original: &str, updated: &str) -> Vec<Replacement> {
    if original == updated {
        return Vec::new();
    }

    let diff = TextDiff::from_lines(original, updated);

    // group changes into hunks of (deleted, inserted) separated by equal runs
    let mut hunks: Vec<(String, String, Option<String>)> = Vec::new();
    let mut deleted = String::new();
    let mut inserted = String::new();
    let mut prev_equal: Option<String> = None;
    let mut in_hunk = false;

    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => {
                if in_hunk {
                    hunks.push((
                        std::mem::take(&mut deleted),
                        std::mem::take(&mut inserted),
                        prev_equal.clone(),
                    ));
                    in_hunk = false;
                }
                prev_equal = Some(change.value().to_string());
            }
            ChangeTag::Delete => {
                in_hunk = true;
                deleted.push_str(change.value());
            }
            ChangeTag::Insert => {
                in_hunk = true;
                inserted.push_str(change.value());
            }
        }
    }
    if in_hunk {
        hunks.push((deleted, inserted, prev_equal));
    }

    let mut replacements = Vec::new();
    for (deleted, inserted, anchor) in hunks {
        if deleted.is_empty() {
            // pure insertion: anchor on the preceding equal line
            match anchor {
                Some(anchor_line) => replacements.push(Replacement::new(
                    anchor_line.clone(),
                    format!("{}{}", anchor_line, inserted),
                )),
                None => {
                    // insertion at the head of the file
                    replacements.push(Replacement::new(
                        original.to_string(),
                        format!("{}{}", inserted, original),
                    ));
                }
            }
        } else {
            replacements.push(Replacement::new(deleted, inserted));
        }
    }

    // verify determinism: sequential first-occurrence application must
    // reproduce the updated content, else fall back to one whole-file swap
    if apply(original, &replacements).as_deref() == Some(updated) {
        replacements
    } else {
        vec![Replacement::new(original.to_string(), updated.to_string())]
    }
}

fn apply(original: &str, replacements: &[Replacement]) -> Option<String> {
    let mut content = original.to_string();
    for replacement in replacements {
        let idx = content.find(&replacement.old)?;
        content.replace_range(idx..idx + replacement.old.len(), &replacement.new);
    }
    Some(content)
}
