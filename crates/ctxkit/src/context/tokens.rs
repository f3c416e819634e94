//! Character-count token estimation.
//!
//! Every budget decision in the crate goes through [`estimate_tokens`]:
//! about four characters per token for English text and code.

use crate::Message;

/// Characters per token used by the estimator.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a piece of text.
///
/// Counts Unicode scalar values, not bytes, and rounds up so any non-empty
/// text costs at least one token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the total token count of a slice of messages.
pub fn estimate_message_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimated_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_free() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up_partial_tokens() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // Four two-byte characters are one token, not two.
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn message_tokens_sum() {
        let messages = vec![Message::user("a".repeat(40)), Message::assistant("b".repeat(8))];
        assert_eq!(estimate_message_tokens(&messages), 12);
    }
}
