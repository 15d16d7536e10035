//! Pluggable token counting, used where callers need a rough size budget
//! over normalized text (e.g. capping a search result snippet).
//!
//! Two implementations: [`BytesEstimateTokenizer`] (fast, no dependencies)
//! and [`TiktokenTokenizer`] (accurate BPE counting, behind the `tiktoken`
//! feature).

use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn name(&self) -> &str;
}

/// Default: bytes/3 estimation.
pub struct BytesEstimateTokenizer;

impl Tokenizer for BytesEstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(3)
    }
    fn name(&self) -> &str {
        "bytes-estimate"
    }
}

#[cfg(feature = "tiktoken")]
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenTokenizer {
    pub fn new() -> Self {
        Self { bpe: tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is bundled and always loadable") }
    }
}

#[cfg(feature = "tiktoken")]
impl Default for TiktokenTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
    fn name(&self) -> &str {
        "tiktoken"
    }
}

/// Create a tokenizer by name, falling back to bytes-estimate for unknown names.
pub fn create_tokenizer(name: &str) -> Arc<dyn Tokenizer> {
    match name {
        #[cfg(feature = "tiktoken")]
        "tiktoken" => Arc::new(TiktokenTokenizer::new()),
        _ => Arc::new(BytesEstimateTokenizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_estimate_rounds_up() {
        let t = BytesEstimateTokenizer;
        assert_eq!(t.count_tokens("ab"), 1);
        assert_eq!(t.count_tokens("abcd"), 2);
    }

    #[test]
    fn unknown_name_falls_back_to_bytes_estimate() {
        let t = create_tokenizer("not-a-real-tokenizer");
        assert_eq!(t.name(), "bytes-estimate");
    }
}
