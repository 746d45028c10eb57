//! Token counting for the flush triggers.
//!
//! With the `bpe` feature and a tokenizer file, counts are exact BPE token
//! counts; otherwise the estimate is `ceil(chars / 4)`, which tracks real
//! tokenizers closely enough for budget triggers.

/// Counts tokens for queued messages.
pub struct TokenCounter {
    #[cfg(feature = "bpe")]
    tokenizer: Option<tokenizers::Tokenizer>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::estimator()
    }
}

impl TokenCounter {
    /// Character-estimate counter.
    pub fn estimator() -> Self {
        Self {
            #[cfg(feature = "bpe")]
            tokenizer: None,
        }
    }

    /// Load a `tokenizer.json` for exact BPE counts. Falls back to the
    /// estimator when loading fails.
    #[cfg(feature = "bpe")]
    pub fn from_file(path: &std::path::Path) -> Self {
        match tokenizers::Tokenizer::from_file(path) {
            Ok(tokenizer) => Self {
                tokenizer: Some(tokenizer),
            },
            Err(e) => {
                tracing::warn!("Failed to load tokenizer, using estimate: {}", e);
                Self::estimator()
            }
        }
    }

    pub fn count(&self, text: &str) -> u32 {
        #[cfg(feature = "bpe")]
        if let Some(tokenizer) = &self.tokenizer {
            if let Ok(encoding) = tokenizer.encode(text, false) {
                return encoding.len() as u32;
            }
        }

        text.chars().count().div_ceil(4) as u32
    }
}
