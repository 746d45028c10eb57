//! Semantic search handler: quota-gated GraphRAG retrieval.

use axum::{extract::State, response::Json, Extension};

use super::state::AppState;
use super::types::{MemoryItem, SearchRequest, SearchResponse};
use crate::auth::AuthContext;
use crate::errors::{Result, ValidationErrorExt};
use crate::metrics;
use crate::retrieve::ScoredMemory;
use crate::types::{Category, OwnerId};
use crate::validation;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

fn to_item(memory: ScoredMemory) -> MemoryItem {
    MemoryItem {
        id: memory.id.to_string(),
        content: memory.content,
        category: memory.category.as_str().to_string(),
        score: memory.score,
    }
}

/// POST /v1/memories/search
///
/// Quota is consumed once per accepted request. Sub-2-character queries
/// return empty without charging; a request over the cap is rejected with
/// an upgrade hint and consumes nothing.
#[tracing::instrument(skip(state, req), fields(user_id = %ctx.user_id))]
pub async fn search_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let project = match &req.project_id {
        Some(p) => {
            validation::validate_project_id(p).map_validation_err("project_id")?;
            p.clone()
        }
        None => ctx.project_id.clone(),
    };
    let owner = OwnerId::new(ctx.user_id.clone(), project);
    let limit = req.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let category = req.category.as_deref().map(Category::parse);

    // Degenerate query: empty result, quota untouched
    if req.query.trim().chars().count() < validation::MIN_QUERY_LENGTH {
        let live = state
            .stores
            .relational
            .count_live_memories_for_user(&ctx.user_id)
            .unwrap_or(0);
        let usage = state.quota.usage(&ctx.user_id, live)?;
        return Ok(Json(SearchResponse {
            data: vec![],
            related_memories: vec![],
            remaining_quota: usage.searches.limit.saturating_sub(usage.searches.used),
        }));
    }

    let remaining = match state.quota.consume_search(&ctx.user_id) {
        Ok(remaining) => remaining,
        Err(e) => {
            metrics::SEARCH_TOTAL
                .with_label_values(&["quota_exceeded"])
                .inc();
            return Err(e);
        }
    };

    let outcome = state
        .retriever
        .search(&owner, &req.query, limit, category)
        .await?;

    Ok(Json(SearchResponse {
        data: outcome.data.into_iter().map(to_item).collect(),
        related_memories: outcome.related.into_iter().map(to_item).collect(),
        remaining_quota: remaining,
    }))
}
