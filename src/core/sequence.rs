//! Sequence tracking for generation requests.
//!
//! A sequence represents a single in-flight generation, tracking its prompt
//! and the tokens emitted so far. Its KV cache entry lives in the
//! [`PagedCache`](crate::core::paged_cache::PagedCache) under the same id.

/// Unique identifier for a sequence. Never reused while the cache lives.
pub type SequenceId = u64;

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The stop token was produced (and dropped).
    StopToken,
    /// Maximum token limit reached.
    MaxTokens,
    /// Cancelled by the caller.
    Cancelled,
    /// A backend or cache failure ended the sequence.
    Failed,
}

impl FinishReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopToken => "stop_token",
            Self::MaxTokens => "max_tokens",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Token record of one generation.
///
/// # Example
///
/// ```
/// use nano_specdec::core::sequence::Sequence;
///
/// let mut seq = Sequence::new(vec![1, 2, 3, 4]);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.output_len(), 0);
///
/// seq.extend(&[5, 6]);
/// assert_eq!(seq.output_len(), 2);
/// assert_eq!(seq.total_len(), 6);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    /// Prompt followed by generated tokens.
    token_ids: Vec<u32>,
    /// Number of prompt tokens at the front of `token_ids`.
    prompt_len: usize,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            token_ids: prompt_token_ids,
            prompt_len,
        }
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.prompt_len]
    }

    /// Get the generated token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    /// Append generated tokens.
    pub fn extend(&mut self, tokens: &[u32]) {
        self.token_ids.extend_from_slice(tokens);
    }

    /// Adopt a caller-supplied context that extends this one.
    ///
    /// Returns `false` (and leaves the sequence untouched) when `context` does
    /// not start with the tokens already recorded. An empty sequence takes the
    /// whole context as its prompt.
    pub fn sync(&mut self, context: &[u32]) -> bool {
        if self.token_ids.is_empty() {
            *self = Self::new(context.to_vec());
            return true;
        }
        if !context.starts_with(&self.token_ids) {
            return false;
        }
        self.token_ids.extend_from_slice(&context[self.token_ids.len()..]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let seq = Sequence::new(vec![10, 20, 30, 40]);
        assert_eq!(seq.prompt_len(), 4);
        assert_eq!(seq.output_len(), 0);
        assert_eq!(seq.total_len(), 4);
        assert_eq!(seq.last_token_id(), Some(40));
    }

    #[test]
    fn test_extend() {
        let mut seq = Sequence::new(vec![1, 2, 3]);
        seq.extend(&[100, 101]);

        assert_eq!(seq.output_token_ids(), &[100, 101]);
        assert_eq!(seq.prompt_token_ids(), &[1, 2, 3]);
        assert_eq!(seq.all_token_ids(), &[1, 2, 3, 100, 101]);
    }

    #[test]
    fn test_sync() {
        let mut seq = Sequence::default();
        assert!(seq.sync(&[1, 2]));
        assert_eq!(seq.prompt_len(), 2);

        assert!(seq.sync(&[1, 2, 7]));
        assert_eq!(seq.all_token_ids(), &[1, 2, 7]);
        assert_eq!(seq.prompt_len(), 2);

        // Shorter or diverging contexts are rejected
        assert!(!seq.sync(&[1, 2]));
        assert!(!seq.sync(&[9, 2, 7, 8]));
        assert_eq!(seq.all_token_ids(), &[1, 2, 7]);
    }

    #[test]
    fn test_finish_reason_names() {
        assert_eq!(FinishReason::StopToken.as_str(), "stop_token");
        assert_eq!(FinishReason::Cancelled.as_str(), "cancelled");
    }
}
