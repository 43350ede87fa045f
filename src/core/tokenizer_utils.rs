/*
 * Token estimation. The module defines `TokenCounterOperations` for counting tokens in a
 * string, and two concrete implementations: `ByteRatioTokenEstimator`, the
 * default, which approximates tokens as serialized bytes / 4, and
 * `CoreTikTokenCounter`, which uses the `tiktoken-rs` cl100k_base encoding for
 * an exact count. Counts shown in the tree are a UI aid, so the cheap estimator
 * is the default and the exact one is opt-in through the settings.
 */
use crate::core::config::TokenEstimatorKind;
use log::error;
use tiktoken_rs::{CoreBPE, cl100k_base};

// Bytes per token assumed by the approximation.
pub const BYTES_PER_TOKEN: usize = 4;

/*
 * Swappable estimator applied to the enveloped text of a file. Implementations
 * must be deterministic: the token cache stores one result per file version.
 * `estimator_id` names the counting scheme; persisted counts are only reused
 * by an estimator reporting the same id.
 */
pub trait TokenCounterOperations: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn estimator_id(&self) -> &'static str;
}

pub const BYTE_RATIO_ESTIMATOR_ID: &str = "byte-ratio-4";
pub const CL100K_ESTIMATOR_ID: &str = "cl100k_base";

/*
 * Estimates tokens as the UTF-8 byte length divided by four, rounded up. This
 * is a documented approximation; it is not meant to agree numerically with any
 * real tokenizer.
 */
pub struct ByteRatioTokenEstimator;

impl ByteRatioTokenEstimator {
    pub fn new() -> Self {
        ByteRatioTokenEstimator
    }
}

impl Default for ByteRatioTokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounterOperations for ByteRatioTokenEstimator {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(BYTES_PER_TOKEN)
    }

    fn estimator_id(&self) -> &'static str {
        BYTE_RATIO_ESTIMATOR_ID
    }
}

/*
 * Exact counts with the cl100k_base encoding from `tiktoken-rs`. The BPE tables are
 * built once at construction. If that fails, the error is logged and counting
 * falls back to the byte-ratio estimate so that the tree still shows numbers.
 */
pub struct CoreTikTokenCounter {
    bpe: Option<CoreBPE>,
}

impl CoreTikTokenCounter {
    pub fn new() -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                error!(
                    "CoreTikTokenCounter: Failed to initialize cl100k_base: {e:?}. Falling back to byte-ratio estimate."
                );
                None
            }
        };
        CoreTikTokenCounter { bpe }
    }
}

impl Default for CoreTikTokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounterOperations for CoreTikTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => ByteRatioTokenEstimator.count_tokens(text),
        }
    }

    // The fallback produces byte-ratio counts, so it shares that id.
    fn estimator_id(&self) -> &'static str {
        match &self.bpe {
            Some(_) => CL100K_ESTIMATOR_ID,
            None => BYTE_RATIO_ESTIMATOR_ID,
        }
    }
}

pub fn create_token_counter(kind: TokenEstimatorKind) -> Box<dyn TokenCounterOperations> {
    match kind {
        TokenEstimatorKind::ByteRatio => Box::new(ByteRatioTokenEstimator::new()),
        TokenEstimatorKind::Cl100k => Box::new(CoreTikTokenCounter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Tests for ByteRatioTokenEstimator ---
    #[test]
    fn test_byte_ratio_empty_string() {
        assert_eq!(ByteRatioTokenEstimator::new().count_tokens(""), 0);
    }

    #[test]
    fn test_byte_ratio_rounds_up_partial_tokens() {
        let estimator = ByteRatioTokenEstimator::new();
        assert_eq!(estimator.count_tokens("abc"), 1);
        assert_eq!(estimator.count_tokens("abcd"), 1);
        assert_eq!(estimator.count_tokens("abcde"), 2);
    }

    #[test]
    fn test_byte_ratio_counts_utf8_bytes_not_chars() {
        // Each 'é' is two bytes in UTF-8.
        assert_eq!(ByteRatioTokenEstimator::new().count_tokens("éééé"), 2);
    }

    // --- Tests for CoreTikTokenCounter ---
    #[test]
    fn test_core_tiktoken_counter_empty_string() {
        assert_eq!(CoreTikTokenCounter::new().count_tokens(""), 0);
    }

    #[test]
    fn test_core_tiktoken_counter_simple_text() {
        // "hello world" is 2 tokens with cl100k_base.
        assert_eq!(CoreTikTokenCounter::new().count_tokens("hello world"), 2);
    }

    #[test]
    fn test_core_tiktoken_counter_text_with_punctuation() {
        assert_eq!(CoreTikTokenCounter::new().count_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_create_token_counter_selects_implementation() {
        let estimator = create_token_counter(TokenEstimatorKind::ByteRatio);
        assert_eq!(estimator.count_tokens("12345678"), 2);
        let exact = create_token_counter(TokenEstimatorKind::Cl100k);
        assert_eq!(exact.count_tokens("hello world"), 2);
    }

    #[test]
    fn test_estimators_report_distinct_ids() {
        let estimator = create_token_counter(TokenEstimatorKind::ByteRatio);
        let exact = create_token_counter(TokenEstimatorKind::Cl100k);
        assert_eq!(estimator.estimator_id(), BYTE_RATIO_ESTIMATOR_ID);
        assert_eq!(exact.estimator_id(), CL100K_ESTIMATOR_ID);
    }
}
