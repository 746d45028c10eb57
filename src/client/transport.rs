//! Client transport: the wire protocol of the ingest endpoints, behind a
//! trait so tests can run against fakes.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;

use super::outbox::{QueuedMemory, QueuedMessage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport failure. Any non-2xx counts as a failed delivery attempt.
#[derive(Debug)]
pub enum TransportError {
    Network(String),
    Http { status: u16, body: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Http { status, body } => write!(f, "HTTP {status}: {body}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Server acknowledgement of an accepted ingest request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskAccepted {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Registration result from auto-register.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub agent_id: String,
    pub api_key: String,
    pub project_id: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_memory(
        &self,
        item: &QueuedMemory,
        project_id: &str,
    ) -> Result<TaskAccepted, TransportError>;

    async fn send_batch(
        &self,
        items: &[QueuedMemory],
        project_id: &str,
    ) -> Result<TaskAccepted, TransportError>;

    /// One segment per request; message order is the wire order.
    async fn send_conversation(
        &self,
        conversation_id: &str,
        messages: &[QueuedMessage],
    ) -> Result<TaskAccepted, TransportError>;

    async fn auto_register(
        &self,
        fingerprint: &str,
        agent_type: &str,
        agent_name: &str,
        platform: &str,
        platform_version: &str,
    ) -> Result<Registration, TransportError>;

    /// Install the API key for subsequent requests.
    fn set_api_key(&self, api_key: &str);
}

/// HTTP transport against a MemoryX server.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
            api_key: RwLock::new(api_key),
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(key) = self.api_key.read().as_deref() {
            request = request.header("X-API-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_accepted(response: reqwest::Response) -> Result<TaskAccepted, TransportError> {
        response
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_memory(
        &self,
        item: &QueuedMemory,
        project_id: &str,
    ) -> Result<TaskAccepted, TransportError> {
        let metadata: serde_json::Value = item
            .metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or(serde_json::Value::Null);
        let response = self
            .post_json(
                "/v1/memories",
                json!({
                    "content": item.content,
                    "project_id": project_id,
                    "metadata": metadata,
                }),
            )
            .await?;
        Self::parse_accepted(response).await
    }

    async fn send_batch(
        &self,
        items: &[QueuedMemory],
        project_id: &str,
    ) -> Result<TaskAccepted, TransportError> {
        let memories: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                let metadata: serde_json::Value = item
                    .metadata
                    .as_deref()
                    .and_then(|m| serde_json::from_str(m).ok())
                    .unwrap_or(serde_json::Value::Null);
                json!({"content": item.content, "metadata": metadata})
            })
            .collect();
        let response = self
            .post_json(
                "/v1/memories/batch",
                json!({"memories": memories, "project_id": project_id}),
            )
            .await?;
        Self::parse_accepted(response).await
    }

    async fn send_conversation(
        &self,
        conversation_id: &str,
        messages: &[QueuedMessage],
    ) -> Result<TaskAccepted, TransportError> {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                    "timestamp": m.queued_at.timestamp_millis(),
                    "tokens": m.tokens,
                })
            })
            .collect();
        let response = self
            .post_json(
                "/v1/conversations/flush",
                json!({
                    "conversation_id": conversation_id,
                    "messages": wire_messages,
                }),
            )
            .await?;
        Self::parse_accepted(response).await
    }

    async fn auto_register(
        &self,
        fingerprint: &str,
        agent_type: &str,
        agent_name: &str,
        platform: &str,
        platform_version: &str,
    ) -> Result<Registration, TransportError> {
        let response = self
            .post_json(
                "/agents/auto-register",
                json!({
                    "machine_fingerprint": fingerprint,
                    "agent_type": agent_type,
                    "agent_name": agent_name,
                    "platform": platform,
                    "platform_version": platform_version,
                }),
            )
            .await?;
        let registration: Registration = response
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("malformed response: {e}")))?;
        self.set_api_key(&registration.api_key);
        Ok(registration)
    }

    fn set_api_key(&self, api_key: &str) {
        *self.api_key.write() = Some(api_key.to_string());
    }
}
