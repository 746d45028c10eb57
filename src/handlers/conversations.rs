//! Conversation-flush handler: accept an ordered segment, deduplicate by
//! segment id within the idempotency window, enqueue extraction.

use axum::{extract::State, response::Json, Extension};

use super::state::AppState;
use super::types::{ConversationFlushRequest, ConversationFlushResponse};
use crate::auth::AuthContext;
use crate::errors::{AppError, Result, ValidationErrorExt};
use crate::types::{ChatMessage, ConversationSegment, OwnerId, TaskPayload};
use crate::validation;

/// POST /v1/conversations/flush
///
/// Message order is preserved end-to-end: the segment is stored in arrival
/// order and the worker processes it in that order. Re-submitting a segment
/// id within 24 hours is a NOOP returning the original task id.
#[tracing::instrument(skip(state, req), fields(user_id = %ctx.user_id, conversation_id = %req.conversation_id))]
pub async fn flush_conversation(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ConversationFlushRequest>,
) -> Result<Json<ConversationFlushResponse>> {
    validation::validate_conversation_id(&req.conversation_id)
        .map_validation_err("conversation_id")?;
    if req.messages.is_empty() {
        return Err(AppError::InvalidInput {
            field: "messages".to_string(),
            reason: "messages cannot be empty".to_string(),
        });
    }
    if req.messages.len() > validation::MAX_MESSAGES_PER_SEGMENT {
        return Err(AppError::InvalidInput {
            field: "messages".to_string(),
            reason: format!(
                "segment exceeds {} messages",
                validation::MAX_MESSAGES_PER_SEGMENT
            ),
        });
    }
    for message in &req.messages {
        validation::validate_content(&message.content).map_validation_err("messages[].content")?;
    }

    let project = match &req.project_id {
        Some(p) => {
            validation::validate_project_id(p).map_validation_err("project_id")?;
            p.clone()
        }
        None => ctx.project_id.clone(),
    };
    let owner = OwnerId::new(ctx.user_id.clone(), project);

    let message_count = req.messages.len();

    // Idempotency: the segment id deduplicates within a 24-hour window
    if let Some(existing) = state
        .stores
        .relational
        .get_idempotency(&owner, &req.conversation_id)
        .map_err(|e| AppError::StorageError(e.to_string()))?
    {
        tracing::debug!(
            "Segment {} already accepted as task {}",
            req.conversation_id,
            existing
        );
        return Ok(Json(ConversationFlushResponse {
            task_id: existing.to_string(),
            extracted_count: message_count,
        }));
    }

    let live = state
        .stores
        .relational
        .count_live_memories_for_user(&ctx.user_id)
        .map_err(|e| AppError::StorageError(e.to_string()))?;
    state.quota.check_memory_cap(&ctx.user_id, live)?;

    let segment = ConversationSegment {
        id: req.conversation_id.clone(),
        messages: req
            .messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
                tokens: m.tokens.unwrap_or(0),
            })
            .collect(),
    };

    let task = state
        .queue
        .submit(owner.clone(), TaskPayload::Conversation { segment })
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    state
        .stores
        .relational
        .put_idempotency(&owner, &req.conversation_id, task.id)
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    Ok(Json(ConversationFlushResponse {
        task_id: task.id.to_string(),
        extracted_count: message_count,
    }))
}
