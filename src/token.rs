use std::sync::Arc;

const CHARS_PER_TOKEN: usize = 4;

/// Trait for estimating token counts in text.
///
/// Implementations should be thread-safe and efficient.
pub trait TokenEstimator: Send + Sync {
    /// Estimates the number of tokens in the given text.
    fn estimate(&self, text: &str) -> usize;
}

/// Character-based estimator: one token per four characters, rounded down.
///
/// This is the figure every stage reports, so condensed and original counts stay
/// comparable across runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl CharEstimator {
    /// Returns a shareable estimator handle.
    #[must_use]
    pub fn shared() -> Arc<dyn TokenEstimator> {
        Arc::new(Self)
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }
}

/// Ratio of condensed to original tokens, 0 when there was nothing to condense.
#[must_use]
pub fn compression_ratio(original_tokens: usize, condensed_tokens: usize) -> f64 {
    if original_tokens == 0 {
        return 0.0;
    }
    condensed_tokens as f64 / original_tokens as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_empty() {
        assert_eq!(CharEstimator.estimate(""), 0);
    }

    #[test]
    fn test_estimator_basic() {
        assert_eq!(CharEstimator.estimate("test"), 1);
        assert_eq!(CharEstimator.estimate("hello world"), 2);
        assert_eq!(CharEstimator.estimate("abc"), 0);
    }

    #[test]
    fn test_estimator_counts_chars_not_bytes() {
        // 8 chars, 14 bytes
        assert_eq!(CharEstimator.estimate("привет!!"), 2);
    }

    #[test]
    fn test_estimator_large_input() {
        let huge_text = "a".repeat(1_000_000);
        assert_eq!(CharEstimator.estimate(&huge_text), 250_000);
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(0, 10), 0.0);
        assert_eq!(compression_ratio(200, 50), 0.25);
    }
}
