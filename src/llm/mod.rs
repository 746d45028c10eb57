//! LLM and embedding clients behind injectable traits.
//!
//! The pipeline never talks to a concrete provider: the aggregator,
//! reconciler and retriever hold `Arc<dyn ChatModel>` / `Arc<dyn Embedder>`
//! handles. Production wires the OpenAI-compatible HTTP client; tests
//! inject deterministic fakes.

pub mod extraction;
pub mod openai;
pub mod prompts;

use async_trait::async_trait;
use std::fmt;

pub use extraction::{ExtractedGraph, FactExtractor, JudgeEvent, JudgeOp, NeighborView, RawFact};
pub use openai::{OpenAiChat, OpenAiEmbedder};

/// Upstream failure classification: transient failures are retried with
/// backoff, permanent ones fail the task immediately.
#[derive(Debug)]
pub enum LlmError {
    /// Temporarily unavailable (connect error, timeout, 429/5xx).
    Transient(String),
    /// Schema mismatch or auth failure against the upstream.
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient upstream failure: {msg}"),
            Self::Permanent(msg) => write!(f, "permanent upstream failure: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Chat-completion model used for summarization, extraction and judging.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;

    fn model_name(&self) -> &str;
}

/// Text embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;
}
