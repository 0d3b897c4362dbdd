//! Pluggable token counting for evidence-pack budgets.

use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn name(&self) -> &str;
}

/// Default heuristic: one token per ~3.5 bytes of source-like text, with a
/// floor of one token per whitespace-separated word.
pub struct EstimateTokenizer;

impl Tokenizer for EstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        let by_bytes = (text.len() * 2).div_ceil(7);
        let by_words = text.split_whitespace().count();
        by_bytes.max(by_words)
    }
    fn name(&self) -> &str {
        "estimate"
    }
}

/// BPE-accurate counting, feature-gated behind `tiktoken`.
#[cfg(feature = "tiktoken")]
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenTokenizer {
    pub fn new() -> Self {
        Self { bpe: tiktoken_rs::cl100k_base().unwrap() }
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

/// Create a tokenizer by name, falling back to the estimate for unknown names.
pub fn create_tokenizer(name: &str) -> Arc<dyn Tokenizer> {
    match name {
        #[cfg(feature = "tiktoken")]
        "tiktoken" => Arc::new(TiktokenTokenizer::new()),
        _ => Arc::new(EstimateTokenizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_scales_with_length() {
        let t = EstimateTokenizer;
        assert_eq!(t.count_tokens(""), 0);
        let short = t.count_tokens("fn main() {}");
        let long = t.count_tokens(&"fn main() {}\n".repeat(50));
        assert!(long > short * 40, "long={long} short={short}");
    }
}
