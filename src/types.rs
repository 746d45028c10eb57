//! Core domain types shared across the ingestion pipeline and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner partition: all data and all per-owner invariants are scoped to
/// the (user, project) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    pub user_id: String,
    pub project_id: String,
}

impl OwnerId {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Stable key prefix used by all three stores.
    pub fn partition_key(&self) -> String {
        format!("{}/{}", self.user_id, self.project_id)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.project_id)
    }
}

/// Closed-set category tag for a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Preference,
    Fact,
    Plan,
    Experience,
    Opinion,
    Correction,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Plan => "plan",
            Self::Experience => "experience",
            Self::Opinion => "opinion",
            Self::Correction => "correction",
            Self::Other => "other",
        }
    }

    /// Lenient parse: unknown tags land in `Other`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "preference" => Self::Preference,
            "fact" => Self::Fact,
            "plan" => Self::Plan,
            "experience" => Self::Experience,
            "opinion" => Self::Opinion,
            "correction" => Self::Correction,
            _ => Self::Other,
        }
    }
}

/// Stable identifier of a memory across all three stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Memory content as stored in the relational row. When a content-at-rest
/// key is configured the plaintext never reaches disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredContent {
    Plain(String),
    Sealed { nonce: Vec<u8>, ciphertext: Vec<u8> },
}

/// Directed relation between two entities, by canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTriple {
    pub source: String,
    pub predicate: String,
    pub target: String,
}

/// The atomic durable unit: one normalized fact owned by one partition.
///
/// The relational row is authoritative. It carries the entity names and
/// relation triples so the drift sweep can rebuild the follower stores
/// (vector index, graph links) from relational truth alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub owner: OwnerId,
    pub content: StoredContent,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Strictly increasing per id; content changes always increment it.
    pub version: u32,
    /// Soft-delete marker. Tombstoned rows stay for audit, are excluded
    /// from search and listing, and have no vector or graph links.
    pub tombstoned: bool,
    /// Contributing source ids (conversation segments, task ids).
    pub sources: Vec<String>,
    /// Canonical entity names mentioned by this memory.
    pub entities: Vec<String>,
    pub relations: Vec<RelationTriple>,
    /// Request-supplied metadata, stored as raw JSON.
    pub metadata: Option<String>,
}

/// Transient candidate produced by the conversation aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    pub text: String,
    pub category: Category,
    /// Extractor confidence in [0, 1].
    pub confidence: f32,
    /// Conversation segment or task this fact came from.
    pub source_id: String,
    pub entities: Vec<String>,
    /// Type tags for entities that came back typed, as (name, type) pairs.
    pub entity_types: Vec<(String, String)>,
    pub relations: Vec<RelationTriple>,
}

/// Message role within a conversation segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of a conversation segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Client wall-clock, milliseconds since epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub tokens: u32,
}

/// Transient ingestion artifact: ordered messages under one client-assigned id.
/// Order is preserved end-to-end from client to reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSegment {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

impl ConversationSegment {
    /// Role-tagged transcript fed to the summarizer.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            out.push_str(msg.role.as_str());
            out.push_str(": ");
            out.push_str(&msg.content);
            out.push('\n');
        }
        out
    }
}

// =============================================================================
// Ingestion tasks
// =============================================================================

/// Task lifecycle: PENDING -> RUNNING -> {SUCCESS | PARTIAL | FAILURE}.
/// Terminal states are durable; the task-status endpoint reads them from
/// the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failure => "FAILURE",
        }
    }
}

/// What an ingestion task operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Direct single-memory write: raw content treated as one user turn.
    Memory {
        content: String,
        metadata: Option<String>,
    },
    /// Batch of direct writes sharing one task.
    Batch { contents: Vec<String> },
    /// A flushed conversation segment. Discarded once summarized.
    Conversation { segment: ConversationSegment },
}

/// One reconciliation decision, kept in the task result for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub fact: String,
    pub op: String,
    pub reason: String,
}

/// Durable outcome of an ingestion task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub added: u32,
    pub updated: u32,
    pub deleted: u32,
    pub noop: u32,
    /// Candidates dropped by the trivial-content filters.
    pub rejected: u32,
    /// Facts whose follower-store writes were compensated.
    pub compensated: Vec<String>,
    pub decisions: Vec<DecisionTrace>,
    pub trace_id: Uuid,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        if self.trace_id.is_nil() {
            self.trace_id = other.trace_id;
        }
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.noop += other.noop;
        self.rejected += other.rejected;
        self.compensated.extend(other.compensated);
        self.decisions.extend(other.decisions);
    }
}

/// Durable ingestion task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub owner: OwnerId,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Arrival order; per-owner FIFO dispatch key.
    pub seq: u64,
    pub attempts: u32,
    pub result: Option<IngestReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(owner: OwnerId, payload: TaskPayload, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            payload,
            status: TaskStatus::Pending,
            seq,
            attempts: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
