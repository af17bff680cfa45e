//! Token estimation used for usage accounting.
//!
//! The backend reports no usage, so both input and output token counts are
//! estimated locally. `TiktokenEstimator` uses the `cl100k_base` vocabulary; when it
//! cannot be loaded the gateway falls back to `HeuristicEstimator`.

use std::sync::Arc;

/// Pure text → token count function. Implementations must be stateless.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

pub struct TiktokenEstimator {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenEstimator {
    pub fn cl100k() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        u32::try_from(self.bpe.encode_ordinary(text).len()).unwrap_or(u32::MAX)
    }
}

/// Roughly four characters per token, rounded up.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn count(&self, text: &str) -> u32 {
        let chars = text.chars().count();
        u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
    }
}

/// Build the process-wide estimator.
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::cl100k() {
        Ok(est) => Arc::new(est),
        Err(e) => {
            tracing::warn!("Failed to load cl100k tokenizer: {} (using heuristic)", e);
            Arc::new(HeuristicEstimator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let est = HeuristicEstimator;
        assert_eq!(est.count(""), 0);
        assert_eq!(est.count("abc"), 1);
        assert_eq!(est.count("abcde"), 2);
    }

    #[test]
    fn tiktoken_counts_words() {
        let est = TiktokenEstimator::cl100k().unwrap();
        assert_eq!(est.count(""), 0);
        let n = est.count("hello world");
        assert!(n >= 2 && n <= 3, "unexpected count {}", n);
    }
}
