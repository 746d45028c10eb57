//! Retriever behavior: graph expansion into related memories, temporal
//! decay ordering, tombstone filtering, and search quotas.

mod common;

use common::{owner, test_context, FakeEmbedder};
use memoryx::chrono::{Duration, Utc};
use memoryx::errors::AppError;
use memoryx::quota::Tier;
use memoryx::store::graph::EntityLabel;
use memoryx::store::vector::VectorPayload;
use memoryx::types::{Category, MemoryId, MemoryRecord, OwnerId, StoredContent};
use uuid::Uuid;

/// Write a memory straight into the stores (no LLM round-trips): a row, a
/// vector and entity links.
fn seed_memory(
    ctx: &common::TestContext,
    owner: &OwnerId,
    content: &str,
    vector: Vec<f32>,
    entities: &[&str],
    updated_days_ago: i64,
) -> MemoryId {
    let id = MemoryId::generate();
    let now = Utc::now();
    let record = MemoryRecord {
        id,
        owner: owner.clone(),
        content: StoredContent::Plain(content.to_string()),
        category: Category::Fact,
        created_at: now - Duration::days(updated_days_ago),
        updated_at: now - Duration::days(updated_days_ago),
        version: 1,
        tombstoned: false,
        sources: vec![],
        entities: entities.iter().map(|s| s.to_string()).collect(),
        relations: vec![],
        metadata: None,
    };
    ctx.state.stores.relational.put_memory(&record).unwrap();
    ctx.state
        .stores
        .vector
        .upsert(
            id.0,
            vector,
            VectorPayload {
                owner: owner.clone(),
                category: Category::Fact,
            },
        )
        .unwrap();
    for name in entities {
        let entity = ctx
            .state
            .stores
            .graph
            .upsert_entity(owner, name, EntityLabel::Other)
            .unwrap();
        ctx.state
            .stores
            .graph
            .link_memory(owner, &id.0, &entity)
            .unwrap();
    }
    id
}

#[tokio::test]
async fn graph_expansion_surfaces_adjacent_memories_as_related() {
    let ctx = test_context();
    let owner = owner();

    // Direct match: high similarity to the query, linked to "Zhang San"
    let direct = seed_memory(
        &ctx,
        &owner,
        "Zhang San leads the routing project",
        FakeEmbedder::basis(0),
        &["Zhang San"],
        0,
    );

    // Graph-adjacent: orthogonal to the query, shares the entity
    let adjacent = seed_memory(
        &ctx,
        &owner,
        "Zhang San mentors two interns",
        FakeEmbedder::basis(7),
        &["Zhang San"],
        0,
    );

    // 40 fillers with small positive similarity crowd out the adjacent
    // memory from the recall set (k = max(limit*3, 30) = 30)
    for i in 0..40 {
        seed_memory(
            &ctx,
            &owner,
            &format!("unrelated filler fact number {i}"),
            FakeEmbedder::blend(0, 6, 0.10),
            &["filler"],
            0,
        );
    }

    let query = "Zhang San routing project";
    ctx.embedder.register(query, FakeEmbedder::basis(0));

    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 1, None)
        .await
        .unwrap();

    assert_eq!(outcome.data.len(), 1);
    assert_eq!(outcome.data[0].id, direct);

    // The entity-adjacent memory was never recalled by the vector pass but
    // arrives through expansion
    assert!(
        outcome.related.iter().any(|m| m.id == adjacent),
        "expected graph-adjacent memory in related_memories"
    );
}

#[tokio::test]
async fn temporal_decay_prefers_fresh_memories_at_equal_similarity() {
    let ctx = test_context();
    let owner = owner();

    let fresh = seed_memory(
        &ctx,
        &owner,
        "the deploy target is staging-2",
        FakeEmbedder::basis(0),
        &["staging-2"],
        0,
    );
    let stale = seed_memory(
        &ctx,
        &owner,
        "the deploy target is staging-1",
        FakeEmbedder::basis(0),
        &["staging-1"],
        90,
    );

    // Lowercase query: no entities resolve, pure vector + decay ranking
    let query = "current deploy target";
    ctx.embedder.register(query, FakeEmbedder::basis(0));

    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 2, None)
        .await
        .unwrap();
    assert_eq!(outcome.data.len(), 2);
    assert_eq!(outcome.data[0].id, fresh);
    assert_eq!(outcome.data[1].id, stale);
    assert!(outcome.data[0].score > outcome.data[1].score);
}

#[tokio::test]
async fn tombstoned_memories_never_surface() {
    let ctx = test_context();
    let owner = owner();

    let id = seed_memory(
        &ctx,
        &owner,
        "forgotten preference",
        FakeEmbedder::basis(0),
        &["preference"],
        0,
    );
    // Tombstone the row but leave the vector (inconsistency window)
    let mut record = ctx
        .state
        .stores
        .relational
        .get_memory(&owner, &id)
        .unwrap()
        .unwrap();
    record.tombstoned = true;
    ctx.state.stores.relational.put_memory(&record).unwrap();

    let query = "forgotten preference lookup";
    ctx.embedder.register(query, FakeEmbedder::basis(0));

    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, None)
        .await
        .unwrap();
    assert!(outcome.data.is_empty());
}

#[tokio::test]
async fn vector_without_relational_row_is_skipped() {
    let ctx = test_context();
    let owner = owner();

    // A vector whose row never landed (the saga window)
    ctx.state
        .stores
        .vector
        .upsert(
            Uuid::new_v4(),
            FakeEmbedder::basis(0),
            VectorPayload {
                owner: owner.clone(),
                category: Category::Fact,
            },
        )
        .unwrap();

    let query = "anything at all";
    ctx.embedder.register(query, FakeEmbedder::basis(0));

    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, None)
        .await
        .unwrap();
    assert!(outcome.data.is_empty());
}

#[tokio::test]
async fn category_filter_narrows_results() {
    let ctx = test_context();
    let owner = owner();

    let pref = seed_memory(
        &ctx,
        &owner,
        "prefers dark mode",
        FakeEmbedder::basis(0),
        &["dark mode"],
        0,
    );
    // Flip its category to preference
    let mut record = ctx
        .state
        .stores
        .relational
        .get_memory(&owner, &pref)
        .unwrap()
        .unwrap();
    record.category = Category::Preference;
    ctx.state.stores.relational.put_memory(&record).unwrap();
    ctx.state
        .stores
        .vector
        .upsert(
            pref.0,
            FakeEmbedder::basis(0),
            VectorPayload {
                owner: owner.clone(),
                category: Category::Preference,
            },
        )
        .unwrap();

    seed_memory(
        &ctx,
        &owner,
        "works at Huawei",
        FakeEmbedder::blend(0, 1, 0.9),
        &["Huawei"],
        0,
    );

    let query = "user settings preference";
    ctx.embedder.register(query, FakeEmbedder::basis(0));

    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, Some(Category::Preference))
        .await
        .unwrap();
    assert_eq!(outcome.data.len(), 1);
    assert_eq!(outcome.data[0].id, pref);
}

// =============================================================================
// Quotas
// =============================================================================

#[test]
fn free_tier_allows_100_searches_then_rejects_without_consuming() {
    let ctx = test_context();
    let quota = &ctx.state.quota;

    for i in 1..=100u32 {
        let remaining = quota.consume_search("agent-q").unwrap();
        assert_eq!(remaining, 100 - i);
    }

    // The 101st is rejected with an upgrade hint...
    let err = quota.consume_search("agent-q").unwrap_err();
    match &err {
        AppError::SearchQuotaExceeded { limit } => assert_eq!(*limit, 100),
        other => panic!("expected quota error, got {other:?}"),
    }
    assert!(err.to_response().hint.unwrap().contains("pro"));

    // ...and consumed nothing: usage still reports 100
    let usage = quota.usage("agent-q", 0).unwrap();
    assert_eq!(usage.searches.used, 100);
    assert_eq!(usage.searches.limit, 100);
}

#[test]
fn pro_tier_raises_the_caps() {
    let ctx = test_context();
    let quota = &ctx.state.quota;

    quota.set_tier("agent-pro", Tier::Pro).unwrap();
    let usage = quota.usage("agent-pro", 0).unwrap();
    assert_eq!(usage.tier, "pro");
    assert_eq!(usage.searches.limit, 10_000);
    assert_eq!(usage.memories.limit, 100_000);
}

#[test]
fn memory_cap_rejects_at_the_limit() {
    let ctx = test_context();
    let quota = &ctx.state.quota;

    assert!(quota.check_memory_cap("agent-m", 999).is_ok());
    let err = quota.check_memory_cap("agent-m", 1_000).unwrap_err();
    assert!(matches!(err, AppError::MemoryQuotaExceeded { limit: 1_000 }));
}
