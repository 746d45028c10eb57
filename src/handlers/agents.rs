//! Agent auto-registration and quota reporting.

use axum::{extract::State, response::Json, Extension};
use chrono::Utc;
use uuid::Uuid;

use super::state::AppState;
use super::types::{AutoRegisterRequest, AutoRegisterResponse, QuotaResponse};
use crate::auth::{self, AuthContext};
use crate::errors::{AppError, Result};
use crate::store::relational::{AgentRecord, ApiKeyRecord};

/// POST /agents/auto-register (public)
///
/// Idempotent per machine fingerprint: a repeated registration returns the
/// existing agent identity with a freshly rotated API key. The key itself
/// is returned exactly once per call; only its hash is stored.
#[tracing::instrument(skip(state, req), fields(agent_type = %req.agent_type))]
pub async fn auto_register(
    State(state): State<AppState>,
    Json(req): Json<AutoRegisterRequest>,
) -> Result<Json<AutoRegisterResponse>> {
    let fingerprint = req.machine_fingerprint.trim().to_lowercase();
    if fingerprint.len() != 32 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::InvalidInput {
            field: "machine_fingerprint".to_string(),
            reason: "expected 32 hex characters (SHA-256 prefix)".to_string(),
        });
    }
    if req.agent_type.trim().is_empty() || req.agent_name.trim().is_empty() {
        return Err(AppError::InvalidInput {
            field: "agent_type".to_string(),
            reason: "agent_type and agent_name are required".to_string(),
        });
    }

    let relational = &state.stores.relational;
    let existing = relational
        .agent_by_fingerprint(&fingerprint)
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    let api_key = auth::generate_api_key();
    let key_hash = auth::hash_api_key(&api_key);

    let agent = match existing {
        Some(mut agent) => {
            // Same machine re-registering: rotate the key, keep identity
            relational
                .delete_api_key(&agent.key_hash)
                .map_err(|e| AppError::StorageError(e.to_string()))?;
            agent.key_hash = key_hash.clone();
            agent
        }
        None => {
            let agent_id = format!("agent-{}", &Uuid::new_v4().simple().to_string()[..12]);
            AgentRecord {
                user_id: agent_id.clone(),
                agent_id,
                fingerprint: fingerprint.clone(),
                agent_type: req.agent_type.trim().to_string(),
                agent_name: req.agent_name.trim().to_string(),
                platform: req.platform.trim().to_string(),
                platform_version: req.platform_version.trim().to_string(),
                project_id: "default".to_string(),
                key_hash: key_hash.clone(),
                created_at: Utc::now(),
            }
        }
    };

    relational
        .put_agent(&agent)
        .map_err(|e| AppError::StorageError(e.to_string()))?;
    relational
        .put_api_key(&ApiKeyRecord {
            key_hash,
            user_id: agent.user_id.clone(),
            project_id: agent.project_id.clone(),
            agent_id: agent.agent_id.clone(),
            created_at: Utc::now(),
            last_used_at: None,
        })
        .map_err(|e| AppError::StorageError(e.to_string()))?;

    tracing::info!(
        "Agent {} registered ({} on {})",
        agent.agent_id,
        agent.agent_type,
        agent.platform
    );

    Ok(Json(AutoRegisterResponse {
        agent_id: agent.agent_id,
        api_key,
        project_id: agent.project_id,
    }))
}

/// GET /v1/quota - current usage and limits for the authenticated agent.
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id))]
pub async fn quota(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<QuotaResponse>> {
    let live = state
        .stores
        .relational
        .count_live_memories_for_user(&ctx.user_id)
        .map_err(|e| AppError::StorageError(e.to_string()))?;
    Ok(Json(state.quota.usage(&ctx.user_id, live)?))
}
