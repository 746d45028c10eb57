//! Structured error types with machine-readable codes.
//!
//! The taxonomy follows the failure kinds the pipeline distinguishes:
//! client faults (4xx, no task created), quota exhaustion (402/429 with an
//! upgrade hint), transient upstream failures (retried, surface as PENDING),
//! permanent upstream failures, partial commits and deadlines.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional context, e.g. an upgrade hint on quota errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Application error types, categorized by HTTP mapping.
#[derive(Debug)]
pub enum AppError {
    // Client faults (400/401/404): no retry, no task created
    InvalidInput { field: String, reason: String },
    MissingApiKey,
    InvalidApiKey,
    MemoryNotFound(String),
    TaskNotFound(String),

    // Quota exhaustion
    /// Daily search cap hit (429). The failing call consumes no quota.
    SearchQuotaExceeded { limit: u32 },
    /// Memory cap hit (402): ingest rejected before a task is created.
    MemoryQuotaExceeded { limit: u64 },

    // Upstream failures
    /// LLM / embedding temporarily unavailable; retried with backoff.
    UpstreamUnavailable(String),
    /// Schema mismatch or auth failure against an upstream; not retried.
    UpstreamPermanent(String),

    // Task-side failures surfaced through the task-status endpoint
    Timeout(String),

    // Internal (500)
    StorageError(String),
    SerializationError(String),
    Internal(anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::MissingApiKey => "MISSING_API_KEY",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::MemoryNotFound(_) => "MEMORY_NOT_FOUND",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::SearchQuotaExceeded { .. } => "SEARCH_QUOTA_EXCEEDED",
            Self::MemoryQuotaExceeded { .. } => "MEMORY_QUOTA_EXCEEDED",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::UpstreamPermanent(_) => "UPSTREAM_PERMANENT",
            Self::Timeout(_) => "TIMEOUT",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Self::MissingApiKey | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::MemoryNotFound(_) | Self::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Self::SearchQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::MemoryQuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamPermanent(_)
            | Self::StorageError(_)
            | Self::SerializationError(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidInput { field, reason } => {
                format!("Invalid input for field '{field}': {reason}")
            }
            Self::MissingApiKey => "Missing X-API-Key header".to_string(),
            Self::InvalidApiKey => "Invalid API key".to_string(),
            Self::MemoryNotFound(id) => format!("Memory not found: {id}"),
            Self::TaskNotFound(id) => format!("Task not found: {id}"),
            Self::SearchQuotaExceeded { limit } => {
                format!("Daily search quota of {limit} exhausted")
            }
            Self::MemoryQuotaExceeded { limit } => {
                format!("Memory cap of {limit} reached")
            }
            Self::UpstreamUnavailable(msg) => format!("Upstream temporarily unavailable: {msg}"),
            Self::UpstreamPermanent(msg) => format!("Upstream failure: {msg}"),
            Self::Timeout(msg) => format!("Deadline exceeded: {msg}"),
            Self::StorageError(msg) => format!("Storage error: {msg}"),
            Self::SerializationError(msg) => format!("Serialization error: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            Self::SearchQuotaExceeded { .. } | Self::MemoryQuotaExceeded { .. } => Some(
                "Upgrade to the pro tier for higher limits: https://t0ken.ai/pricing".to_string(),
            ),
            _ => None,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code().to_string(),
            message: self.message(),
            hint: self.hint(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_response();
        (status, Json(body)).into_response()
    }
}

/// Helper trait mapping validation failures to `InvalidInput`.
pub trait ValidationErrorExt<T> {
    fn map_validation_err(self, field: &str) -> Result<T>;
}

impl<T> ValidationErrorExt<T> for anyhow::Result<T> {
    fn map_validation_err(self, field: &str) -> Result<T> {
        self.map_err(|e| AppError::InvalidInput {
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Type alias for Results using AppError.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(AppError::MissingApiKey.code(), "MISSING_API_KEY");
        assert_eq!(
            AppError::MemoryNotFound("m1".to_string()).code(),
            "MEMORY_NOT_FOUND"
        );
        assert_eq!(
            AppError::SearchQuotaExceeded { limit: 100 }.code(),
            "SEARCH_QUOTA_EXCEEDED"
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            AppError::SearchQuotaExceeded { limit: 100 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::MemoryQuotaExceeded { limit: 1000 }.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::UpstreamUnavailable("llm".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn quota_errors_carry_upgrade_hint() {
        let resp = AppError::SearchQuotaExceeded { limit: 100 }.to_response();
        assert!(resp.hint.is_some());
        assert!(resp.hint.unwrap().contains("pro"));

        let resp = AppError::InvalidApiKey.to_response();
        assert!(resp.hint.is_none());
    }
}
