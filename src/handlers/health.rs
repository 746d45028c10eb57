//! Health and metrics endpoints (public, unauthenticated).

use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use super::state::AppState;
use crate::metrics;

/// GET /health - liveness plus store snapshot. Also refreshes the
/// aggregate store gauges so scrapes stay current.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let queue_depth = state.queue.depth().unwrap_or(0);
    let vector_entries = state.stores.vector.len();

    metrics::VECTOR_INDEX_SIZE.set(vector_entries as i64);
    if let Ok(entities) = state.stores.graph.entity_count() {
        metrics::GRAPH_ENTITY_COUNT.set(entities as i64);
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "vector_entries": vector_entries,
        "queue_depth": queue_depth,
    }))
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics_endpoint() -> String {
    metrics::gather()
}
