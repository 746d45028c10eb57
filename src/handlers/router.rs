//! Router configuration: public routes (health, metrics, registration) and
//! the API-key protected surface.

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use super::state::AppState;
use super::{agents, conversations, health, memories, search};
use crate::auth;

/// Routes reachable without an API key: probes, metrics scraping and the
/// registration bootstrap.
pub fn build_public_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics_endpoint))
        .route("/agents/auto-register", post(agents::auto_register))
        .with_state(state)
}

/// API-key protected routes. The auth middleware resolves the key against
/// the relational store and injects the owning identity.
pub fn build_protected_routes(state: AppState) -> Router {
    let relational = state.stores.relational.clone();
    Router::new()
        // =================================================================
        // INGEST
        // =================================================================
        .route("/v1/memories", post(memories::create_memory))
        .route("/v1/memories/batch", post(memories::batch_memories))
        .route(
            "/v1/conversations/flush",
            post(conversations::flush_conversation),
        )
        // =================================================================
        // RETRIEVAL
        // =================================================================
        .route("/v1/memories/search", post(search::search_memories))
        .route("/v1/memories/list", get(memories::list_memories))
        // =================================================================
        // LIFECYCLE
        // =================================================================
        .route("/v1/memories/{id}", delete(memories::delete_memory))
        .route("/v1/memories/task/{task_id}", get(memories::task_status))
        // =================================================================
        // QUOTA
        // =================================================================
        .route("/v1/quota", get(agents::quota))
        .layer(middleware::from_fn_with_state(
            relational,
            auth::auth_middleware,
        ))
        .with_state(state)
}

/// The complete router. Rate limiting and CORS are applied by the caller.
pub fn build_router(state: AppState) -> Router {
    let public = build_public_routes(state.clone());
    let protected = build_protected_routes(state);
    Router::new().merge(public).merge(protected)
}
