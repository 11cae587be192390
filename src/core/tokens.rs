//! Token-count estimation.
//!
//! A single process-shared [`TokenCounter`] backs every component that sizes
//! text: the router's preflight estimate, the chunker's window arithmetic,
//! and the embedding client's rate reservations. Counting is side-effect
//! free and thread-safe; the counter is immutable after initialization.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Encoding used when the exact tokenizer is available.
const ENCODING_NAME: &str = "cl100k_base";

static SHARED: Lazy<TokenCounter> = Lazy::new(TokenCounter::new);

/// Token counter with an exact BPE path and a `len/4` heuristic fallback.
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    /// Build a counter, falling back to the heuristic when the encoding
    /// cannot be constructed.
    pub fn new() -> Self {
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Self { bpe: Some(bpe) },
            Err(e) => {
                warn!("tokenizer unavailable, falling back to len/4 heuristic: {e}");
                Self { bpe: None }
            }
        }
    }

    /// The process-shared counter.
    pub fn shared() -> &'static TokenCounter {
        &SHARED
    }

    /// Count tokens in `text`. Always at least 1, including for empty input.
    pub fn count(&self, text: &str) -> usize {
        let count = match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len() / 4,
        };
        count.max(1)
    }

    /// Name of the encoding in use.
    pub fn encoding(&self) -> &'static str {
        if self.bpe.is_some() {
            ENCODING_NAME
        } else {
            "heuristic"
        }
    }

    /// Whether counts come from the `len/4` heuristic rather than a real BPE.
    pub fn is_heuristic(&self) -> bool {
        self.bpe.is_none()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_at_least_one() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count(""), 1);
        assert!(counter.count("x") >= 1);
    }

    #[test]
    fn test_count_grows_with_input() {
        let counter = TokenCounter::new();
        let short = counter.count("fn main() {}");
        let long = counter.count(&"fn main() {}\n".repeat(200));
        assert!(long > short);
    }

    #[test]
    fn test_shared_counter_is_stable() {
        let a = TokenCounter::shared().count("let x = 1;");
        let b = TokenCounter::shared().count("let x = 1;");
        assert_eq!(a, b);
    }

    #[test]
    fn test_encoding_name_reported() {
        let counter = TokenCounter::new();
        if counter.is_heuristic() {
            assert_eq!(counter.encoding(), "heuristic");
        } else {
            assert_eq!(counter.encoding(), "cl100k_base");
        }
    }
}
