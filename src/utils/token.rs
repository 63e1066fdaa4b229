//! Token counting traits and utilities

use log::warn;

use crate::utils::llm::ChatMessage;

#[cfg(feature = "openai")]
pub mod tiktoken;

const TOKENS_PER_MESSAGE: usize = 3;

/// Trait for counting tokens in a string.
pub trait CountToken {
    fn count_token(&self, string: &str) -> usize;

    /// Count the tokens of a chat message including the per-message overhead.
    fn count_msg_token(&self, msg: &ChatMessage) -> usize {
        self.count_token(&msg.content) + TOKENS_PER_MESSAGE
    }
}

/// Blanket impl of CountToken for Fn(&str) -> usize.
impl<F> CountToken for F where F: Fn(&str) -> usize {
    fn count_token(&self, string: &str) -> usize {
        self(string)
    }
}

/// Count the number of tokens in a string by the number of chars of the string.
#[inline]
pub fn count_tokens_by_len(string: &str) -> usize {
    string.chars().count()
}

/// Keep the leading blocks whose cumulative token count fits in `budget`.
///
/// At least one block is kept so that a transcript is never empty when there is something to show.
pub fn truncate_blocks<C: CountToken + ?Sized>(blocks: &[String], counter: &C, budget: usize) -> Vec<String> {
    let mut used = 0;
    let mut kept = Vec::with_capacity(blocks.len());
    for block in blocks {
        let cost = counter.count_token(block);
        if !kept.is_empty() && used + cost > budget {
            break;
        }
        used += cost;
        kept.push(block.clone());
    }
    if kept.len() < blocks.len() {
        warn!("transcript truncated to {} of {} blocks to fit {} tokens", kept.len(), blocks.len(), budget);
    }
    kept
}

#[cfg(test)]
mod test_token {
    use super::{count_tokens_by_len, truncate_blocks, CountToken};
    use crate::utils::llm::ChatMessage;

    #[test]
    fn test_str_len_impl() {
        let counter = str::len;
        let size = counter.count_token("");
        assert_eq!(0, size);
        assert_eq!(count_tokens_by_len("héllo"), 5);
        assert_eq!(count_tokens_by_len.count_msg_token(&ChatMessage::user("abc")), 6);
    }

    #[test]
    fn test_truncate_blocks() {
        let blocks: Vec<String> = ["aaaa", "bbbb", "cccc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(truncate_blocks(&blocks, &count_tokens_by_len, 8), blocks[..2].to_vec());
        assert_eq!(truncate_blocks(&blocks, &count_tokens_by_len, 100), blocks);
        // an oversized first block is still kept
        assert_eq!(truncate_blocks(&blocks, &count_tokens_by_len, 1), blocks[..1].to_vec());
        assert!(truncate_blocks(&[], &count_tokens_by_len, 1).is_empty());
    }
}
