//! Memory ingest, listing, deletion and task-status handlers.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use uuid::Uuid;

use super::state::AppState;
use super::types::{
    BatchMemoryRequest, CreateMemoryRequest, DeleteResponse, ListItem, ListQuery, ListResponse,
    TaskAcceptedResponse, TaskResultBody, TaskStatusResponse,
};
use crate::auth::AuthContext;
use crate::crypto::open_content;
use crate::errors::{AppError, Result, ValidationErrorExt};
use crate::reconcile::SagaError;
use crate::types::{MemoryId, OwnerId, TaskPayload};
use crate::validation;

fn resolve_owner(ctx: &AuthContext, project_id: Option<&String>) -> Result<OwnerId> {
    let project = match project_id {
        Some(p) => {
            validation::validate_project_id(p).map_validation_err("project_id")?;
            p.clone()
        }
        None => ctx.project_id.clone(),
    };
    Ok(OwnerId::new(ctx.user_id.clone(), project))
}

fn check_memory_cap(state: &AppState, user_id: &str) -> Result<()> {
    let live = state
        .stores
        .relational
        .count_live_memories_for_user(user_id)
        .map_err(|e| AppError::StorageError(e.to_string()))?;
    state.quota.check_memory_cap(user_id, live)
}

/// POST /v1/memories - accept one memory for asynchronous ingestion.
#[tracing::instrument(skip(state, req), fields(user_id = %ctx.user_id))]
pub async fn create_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateMemoryRequest>,
) -> Result<Json<TaskAcceptedResponse>> {
    validation::validate_content(&req.content).map_validation_err("content")?;
    let owner = resolve_owner(&ctx, req.project_id.as_ref())?;
    check_memory_cap(&state, &ctx.user_id)?;

    let task = state
        .queue
        .submit(
            owner,
            TaskPayload::Memory {
                content: req.content,
                metadata: req.metadata.map(|m| m.to_string()),
            },
        )
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    Ok(Json(TaskAcceptedResponse {
        task_id: task.id.to_string(),
        status: task.status.as_str().to_string(),
    }))
}

/// POST /v1/memories/batch - accept a batch of memories under one task.
#[tracing::instrument(skip(state, req), fields(user_id = %ctx.user_id, batch = req.memories.len()))]
pub async fn batch_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<BatchMemoryRequest>,
) -> Result<Json<TaskAcceptedResponse>> {
    if req.memories.is_empty() {
        return Err(AppError::InvalidInput {
            field: "memories".to_string(),
            reason: "batch cannot be empty".to_string(),
        });
    }
    if req.memories.len() > validation::MAX_BATCH_SIZE {
        return Err(AppError::InvalidInput {
            field: "memories".to_string(),
            reason: format!("batch exceeds {} items", validation::MAX_BATCH_SIZE),
        });
    }
    for item in &req.memories {
        validation::validate_content(&item.content).map_validation_err("memories[].content")?;
    }
    let owner = resolve_owner(&ctx, req.project_id.as_ref())?;
    check_memory_cap(&state, &ctx.user_id)?;

    let contents = req.memories.into_iter().map(|m| m.content).collect();
    let task = state
        .queue
        .submit(owner, TaskPayload::Batch { contents })
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    Ok(Json(TaskAcceptedResponse {
        task_id: task.id.to_string(),
        status: task.status.as_str().to_string(),
    }))
}

/// GET /v1/memories/list - live memories, newest first, paginated.
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id))]
pub async fn list_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let owner = resolve_owner(&ctx, query.project_id.as_ref())?;
    let limit = query.limit.unwrap_or(50).min(validation::MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let (rows, total) = state
        .stores
        .relational
        .list_memories(&owner, limit, offset)
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        let content = open_content(state.cipher.as_ref(), &row.content)
            .map_err(|e| AppError::StorageError(e.to_string()))?;
        data.push(ListItem {
            id: row.id.to_string(),
            content,
            category: row.category.as_str().to_string(),
            created_at: row.created_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
            version: row.version,
        });
    }

    Ok(Json(ListResponse { data, total }))
}

/// DELETE /v1/memories/{id} - synchronous tombstone via the saga.
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id, memory_id = %memory_id))]
pub async fn delete_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(memory_id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let id = validation::validate_memory_id(&memory_id).map_validation_err("memory_id")?;

    let record = state
        .stores
        .relational
        .find_memory_for_user(&ctx.user_id, &MemoryId(id))
        .map_err(|e| AppError::StorageError(e.to_string()))?
        .filter(|m| !m.tombstoned)
        .ok_or_else(|| AppError::MemoryNotFound(memory_id.clone()))?;

    match state
        .reconciler
        .saga()
        .commit_delete(&record.owner, &record.id)
    {
        Ok(()) => Ok(Json(DeleteResponse { success: true })),
        Err(SagaError::Relational(e)) => Err(AppError::StorageError(e.to_string())),
        // Follower failure was compensated; relational truth is unchanged
        Err(SagaError::Follower { step, source }) => {
            tracing::warn!("Delete of {} compensated at {} step: {}", memory_id, step, source);
            Err(AppError::StorageError(format!(
                "delete could not complete ({step} store failed)"
            )))
        }
    }
}

/// GET /v1/memories/task/{task_id} - durable task status.
#[tracing::instrument(skip(state))]
pub async fn task_status(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>> {
    let id = Uuid::parse_str(&task_id).map_err(|_| AppError::InvalidInput {
        field: "task_id".to_string(),
        reason: "not a UUID".to_string(),
    })?;

    let task = state
        .queue
        .get(&id)
        .map_err(|e| AppError::StorageError(e.to_string()))?
        .ok_or_else(|| AppError::TaskNotFound(task_id))?;

    Ok(Json(TaskStatusResponse {
        status: task.status.as_str().to_string(),
        result: task.result.map(|r| TaskResultBody {
            added: r.added,
            updated: r.updated,
            deleted: r.deleted,
            noop: r.noop,
            rejected: r.rejected,
            trace_id: r.trace_id.to_string(),
        }),
        error: task.error,
    }))
}
