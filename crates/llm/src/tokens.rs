//! Token Estimation
//!
//! Fast byte-ratio token estimate used for budgeting when a provider has no
//! exact tokenizer. Overestimates slightly for dense code, which is the safe
//! direction for budget checks.

/// Approximate tokens in `text` (roughly one token per 3.5 bytes).
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / 3.5).ceil() as usize
}

/// Fixed per-request overhead added to every completion's input estimate.
pub const TOKENS_PER_REQUEST: usize = 4;

/// Fixed per-message framing overhead.
pub const TOKENS_PER_MESSAGE: usize = 4;

/// Estimate the total input tokens of a message list including framing.
pub fn estimate_messages_tokens(messages: &[crate::types::ChatMessage]) -> usize {
    let content: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    content + messages.len() * TOKENS_PER_MESSAGE + TOKENS_PER_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn test_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_rough_ratio() {
        let text = "a".repeat(350);
        assert_eq!(estimate_tokens(&text), 100);
    }

    #[test]
    fn test_messages_include_overhead() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hello")];
        let base: usize = messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        assert_eq!(
            estimate_messages_tokens(&messages),
            base + 2 * TOKENS_PER_MESSAGE + TOKENS_PER_REQUEST
        );
    }
}
