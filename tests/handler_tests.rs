//! HTTP surface tests: registration, API-key auth, ingest acceptance,
//! conversation idempotency and quota reporting, driven through the router
//! with no network.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::test_context;
use memoryx::handlers::build_router;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn post(path: &str, api_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(path: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::empty()).unwrap()
}

/// Register an agent and return its API key.
async fn register(router: &axum::Router) -> (String, String) {
    let response = router
        .clone()
        .oneshot(post(
            "/agents/auto-register",
            None,
            json!({
                "machine_fingerprint": "0123456789abcdef0123456789abcdef",
                "agent_type": "rust_sdk",
                "agent_name": "test-agent",
                "platform": "linux",
                "platform_version": "6.1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    (
        body["api_key"].as_str().unwrap().to_string(),
        body["agent_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn auto_register_issues_a_working_key() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());

    let (api_key, agent_id) = register(&router).await;
    assert!(api_key.starts_with("mx-"));
    assert!(agent_id.starts_with("agent-"));

    // The key authenticates against protected routes
    let response = router
        .clone()
        .oneshot(get("/v1/quota", Some(&api_key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tier"], "free");
    assert_eq!(body["searches"]["limit"], 100);
    assert!(body["searches"]["resets_at"].as_str().is_some());
}

#[tokio::test]
async fn reregistration_keeps_identity_and_rotates_the_key() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());

    let (key_one, agent_one) = register(&router).await;
    let (key_two, agent_two) = register(&router).await;

    assert_eq!(agent_one, agent_two, "same fingerprint, same agent");
    assert_ne!(key_one, key_two, "keys rotate on re-registration");

    // The fresh key works
    let response = router
        .clone()
        .oneshot(get("/v1/quota", Some(&key_two)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_or_invalid_key_is_unauthorized() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());

    let response = router
        .clone()
        .oneshot(post("/v1/memories", None, json!({"content": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "MISSING_API_KEY");

    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories",
            Some("mx-not-a-real-key"),
            json!({"content": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_API_KEY");
}

#[tokio::test]
async fn create_memory_returns_a_pending_task() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, _) = register(&router).await;

    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories",
            Some(&api_key),
            json!({"content": "Zhang San works at Huawei"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "PENDING");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    // The task endpoint reads the durable row (no worker running here)
    let response = router
        .clone()
        .oneshot(get(&format!("/v1/memories/task/{task_id}"), Some(&api_key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "PENDING");
}

#[tokio::test]
async fn malformed_requests_are_client_faults_with_no_task() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, _) = register(&router).await;

    // Empty content
    let response = router
        .clone()
        .oneshot(post("/v1/memories", Some(&api_key), json!({"content": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Empty batch
    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories/batch",
            Some(&api_key),
            json!({"memories": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown memory id on delete
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/memories/{}", uuid::Uuid::new_v4()))
                .header("X-API-Key", &api_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // No tasks were created by any of the above
    assert_eq!(ctx.state.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn conversation_flush_is_idempotent_within_the_window() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, _) = register(&router).await;

    let segment = json!({
        "conversation_id": "conv-repeat-42",
        "messages": [
            {"role": "user", "content": "I moved to Berlin last month", "timestamp": 1000, "tokens": 7},
            {"role": "assistant", "content": "Noted, Berlin it is", "timestamp": 2000, "tokens": 5},
        ],
    });

    let response = router
        .clone()
        .oneshot(post("/v1/conversations/flush", Some(&api_key), segment.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = body_json(response).await;
    assert_eq!(first["extracted_count"], 2);

    // Identical segment id inside 24h: same task id, no second task
    let response = router
        .clone()
        .oneshot(post("/v1/conversations/flush", Some(&api_key), segment))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = body_json(response).await;
    assert_eq!(first["task_id"], second["task_id"]);
    assert_eq!(ctx.state.queue.depth().unwrap(), 1);
}

#[tokio::test]
async fn short_query_returns_empty_without_charging_quota() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, _) = register(&router).await;

    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories/search",
            Some(&api_key),
            json!({"query": "a"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"], json!([]));
    assert_eq!(body["remaining_quota"], 100);

    // Quota untouched
    let response = router
        .clone()
        .oneshot(get("/v1/quota", Some(&api_key)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["searches"]["used"], 0);
}

#[tokio::test]
async fn search_consumes_quota_and_reports_remaining() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, _) = register(&router).await;

    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories/search",
            Some(&api_key),
            json!({"query": "what is the deploy target"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["remaining_quota"], 99);

    let response = router
        .clone()
        .oneshot(get("/v1/quota", Some(&api_key)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["searches"]["used"], 1);
}

#[tokio::test]
async fn exhausted_quota_rejects_with_upgrade_hint() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, agent_id) = register(&router).await;

    // Burn the full daily budget below the HTTP layer
    for _ in 0..100 {
        ctx.state.quota.consume_search(&agent_id).unwrap();
    }

    let response = router
        .clone()
        .oneshot(post(
            "/v1/memories/search",
            Some(&api_key),
            json!({"query": "quota consumer"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["code"], "SEARCH_QUOTA_EXCEEDED");
    assert!(body["hint"].as_str().unwrap().contains("pro"));

    // The rejected call consumed nothing
    let usage = ctx.state.quota.usage(&agent_id, 0).unwrap();
    assert_eq!(usage.searches.used, 100);
}

#[tokio::test]
async fn list_reflects_ingested_memories() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());
    let (api_key, agent_id) = register(&router).await;

    // Ingest synchronously through the worker for determinism
    let owner = memoryx::types::OwnerId::new(agent_id, "default");
    common::ingest_text(&ctx.state, &owner, "Li Si speaks French fluently").await;

    let response = router
        .clone()
        .oneshot(get("/v1/memories/list?limit=10&offset=0", Some(&api_key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert!(body["data"][0]["content"]
        .as_str()
        .unwrap()
        .contains("French"));
    assert_eq!(body["data"][0]["version"], 1);

    // Delete it over HTTP and watch it disappear from the listing
    let memory_id = body["data"][0]["id"].as_str().unwrap().to_string();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/memories/{memory_id}"))
                .header("X-API-Key", &api_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);

    let response = router
        .clone()
        .oneshot(get("/v1/memories/list?limit=10&offset=0", Some(&api_key)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn health_and_metrics_are_public() {
    let ctx = test_context();
    let router = build_router(ctx.state.clone());

    let response = router.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    let response = router.clone().oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
