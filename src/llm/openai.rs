//! OpenAI-compatible HTTP clients for chat completion and embeddings.
//!
//! A shared semaphore bounds in-flight calls to respect upstream rate
//! limits; callers above this layer handle retries.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::{ChatModel, Embedder, LlmError};
use crate::config::ModelEndpoint;
use crate::metrics;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    if status.as_u16() == 429 || status.is_server_error() {
        LlmError::Transient(format!("HTTP {status}: {body}"))
    } else {
        LlmError::Permanent(format!("HTTP {status}: {body}"))
    }
}

fn classify_request_error(e: reqwest::Error) -> LlmError {
    // Connection problems and timeouts are worth retrying
    if e.is_timeout() || e.is_connect() || e.is_request() {
        LlmError::Transient(e.to_string())
    } else {
        LlmError::Permanent(e.to_string())
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat client against an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChat {
    http: reqwest::Client,
    endpoint: ModelEndpoint,
    semaphore: Arc<Semaphore>,
}

impl OpenAiChat {
    pub fn new(endpoint: ModelEndpoint, semaphore: Arc<Semaphore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            semaphore,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Permanent("LLM semaphore closed".to_string()))?;

        let start = Instant::now();
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .json(&json!({
                "model": self.endpoint.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.1,
            }));
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let result = async {
            let response = request.send().await.map_err(classify_request_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }
            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| LlmError::Permanent(format!("malformed chat response: {e}")))?;
            parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| LlmError::Permanent("chat response has no choices".to_string()))
        }
        .await;

        let elapsed = start.elapsed().as_secs_f64();
        metrics::LLM_CALL_DURATION
            .with_label_values(&["chat"])
            .observe(elapsed);
        metrics::LLM_CALLS_TOTAL
            .with_label_values(&["chat", if result.is_ok() { "ok" } else { "error" }])
            .inc();

        result
    }

    fn model_name(&self) -> &str {
        &self.endpoint.model
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Embedding client against an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    endpoint: ModelEndpoint,
    dim: usize,
    semaphore: Arc<Semaphore>,
}

impl OpenAiEmbedder {
    pub fn new(endpoint: ModelEndpoint, dim: usize, semaphore: Arc<Semaphore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            dim,
            semaphore,
        }
    }

    async fn request_embeddings(&self, input: serde_json::Value) -> Result<Vec<Vec<f32>>, LlmError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Permanent("embedding semaphore closed".to_string()))?;

        let start = Instant::now();
        let mut request = self
            .http
            .post(format!("{}/embeddings", self.endpoint.base_url))
            .json(&json!({
                "model": self.endpoint.model,
                "input": input,
            }));
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let result = async {
            let response = request.send().await.map_err(classify_request_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }
            let parsed: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| LlmError::Permanent(format!("malformed embedding response: {e}")))?;

            let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
            for vector in &vectors {
                if vector.len() != self.dim {
                    return Err(LlmError::Permanent(format!(
                        "embedding dimension mismatch: got {}, expected {}",
                        vector.len(),
                        self.dim
                    )));
                }
            }
            Ok(vectors)
        }
        .await;

        let elapsed = start.elapsed().as_secs_f64();
        metrics::LLM_CALL_DURATION
            .with_label_values(&["embed"])
            .observe(elapsed);
        metrics::LLM_CALLS_TOTAL
            .with_label_values(&["embed", if result.is_ok() { "ok" } else { "error" }])
            .inc();

        result
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self.request_embeddings(json!(text)).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::Permanent("embedding response is empty".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request_embeddings(json!(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::Permanent(format!(
                "embedding batch size mismatch: got {}, expected {}",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
