//! pdx Line Number Prefixes
//!
//! The validation prompts number every line of the original and proposed
//! content as `pdx-N: `. Replacement `<Old>` blocks quote these prefixes so
//! line ranges can be resolved against the numbered original exactly.

/// Prefix each line as `pdx-N: ` starting at 1.
pub fn add_line_nums(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut lines = text.split('\n').peekable();
    let mut n = 1;
    while let Some(line) = lines.next() {
        out.push_str(&format!("pdx-{}: {}", n, line));
        if lines.peek().is_some() {
            out.push('\n');
        }
        n += 1;
    }
    out
}

/// Strip `pdx-N: ` prefixes from lines that carry them.
pub fn remove_line_nums(text: &str) -> String {
    text.split('\n')
        .map(strip_line_num)
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_line_num(line: &str) -> &str {
    let Some(rest) = line.strip_prefix("pdx-") else {
        return line;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return line;
    }
    match rest[digits..].strip_prefix(": ") {
        Some(stripped) => stripped,
        None => rest[digits..].strip_prefix(':').unwrap_or(line),
    }
}

/// Extract the line number from a `pdx-N: ...` line.
pub fn extract_line_number(line: &str) -> Option<usize> {
    let rest = line.trim_start().strip_prefix("pdx-")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_round_trip() {
        let text = "fn main() {\n    run();\n}\n";
        let numbered = add_line_nums(text);
        assert!(numbered.starts_with("pdx-1: fn main() {"));
        assert!(numbered.contains("pdx-2:     run();"));
        assert_eq!(remove_line_nums(&numbered), text);
    }

    #[test]
    fn test_extract_line_number() {
        assert_eq!(extract_line_number("pdx-12:     run();"), Some(12));
        assert_eq!(extract_line_number("  pdx-3: x"), Some(3));
        assert_eq!(extract_line_number("no prefix"), None);
        assert_eq!(extract_line_number("pdx-: bad"), None);
    }

    #[test]
    fn test_remove_passes_unprefixed_lines() {
        let mixed = "pdx-1: old line\nbrand new line";
        assert_eq!(remove_line_nums(mixed), "old line\nbrand new line");
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(add_line_nums(""), "pdx-1: ");
        assert_eq!(remove_line_nums("pdx-1: "), "");
    }
}
