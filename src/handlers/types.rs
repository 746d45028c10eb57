//! Canonical request/response shapes of the HTTP surface.
//!
//! These records are the contract: fields not listed here are not part of
//! the API.

use serde::{Deserialize, Serialize};

use crate::quota::QuotaUsage;
use crate::types::Role;

// =============================================================================
// Ingest
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateMemoryRequest {
    pub content: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BatchMemoryItem {
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BatchMemoryRequest {
    pub memories: Vec<BatchMemoryItem>,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Accepted ingest request: poll the task endpoint with `task_id`.
#[derive(Debug, Serialize)]
pub struct TaskAcceptedResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageItem {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationFlushRequest {
    pub conversation_id: String,
    pub messages: Vec<MessageItem>,
    #[serde(default)]
    pub project_id: Option<String>,
}

/// `extracted_count` is the number of messages accepted into the task;
/// fact extraction itself is asynchronous.
#[derive(Debug, Serialize)]
pub struct ConversationFlushResponse {
    pub task_id: String,
    pub extracted_count: usize,
}

// =============================================================================
// Search / list
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub category: String,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub data: Vec<MemoryItem>,
    pub related_memories: Vec<MemoryItem>,
    pub remaining_quota: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListItem {
    pub id: String,
    pub content: String,
    pub category: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub data: Vec<ListItem>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

// =============================================================================
// Tasks / quota / registration
// =============================================================================

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResultBody {
    pub added: u32,
    pub updated: u32,
    pub deleted: u32,
    pub noop: u32,
    pub rejected: u32,
    pub trace_id: String,
}

pub type QuotaResponse = QuotaUsage;

#[derive(Debug, Deserialize)]
pub struct AutoRegisterRequest {
    pub machine_fingerprint: String,
    pub agent_type: String,
    pub agent_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub platform_version: String,
}

#[derive(Debug, Serialize)]
pub struct AutoRegisterResponse {
    pub agent_id: String,
    pub api_key: String,
    pub project_id: String,
}
