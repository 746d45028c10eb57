//! End-to-end reconciliation scenarios: dedup (NOOP), refinement (UPDATE),
//! negation (DELETE + ADD), saga compensation and the drift sweep
//! invariants. LLM and embeddings are scripted fakes; stores are real.

mod common;

use common::{ingest_text, owner, test_context, FakeEmbedder};
use serde_json::json;

use memoryx::store::vector::VectorPayload;
use memoryx::types::{Category, MemoryId, StoredContent, TaskStatus};

#[tokio::test]
async fn duplicate_add_is_noop_and_keeps_one_row() {
    let ctx = test_context();
    let owner = owner();
    let text = "Zhang San works at Huawei as senior engineer";
    ctx.embedder.register(text, FakeEmbedder::basis(0));

    // First call creates the memory
    let first = ingest_text(&ctx.state, &owner, text).await;
    assert_eq!(first.status, TaskStatus::Success);
    let report = first.result.as_ref().unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.noop, 0);

    // Identical second call reconciles to NOOP without touching the judge
    let second = ingest_text(&ctx.state, &owner, text).await;
    assert_eq!(second.status, TaskStatus::Success);
    let report = second.result.as_ref().unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.noop, 1);

    // Exactly one relational row, one vector entry
    let (rows, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 1);
    assert_eq!(ctx.state.stores.vector.len(), 1);
}

#[tokio::test]
async fn refinement_updates_in_place_and_bumps_version() {
    let ctx = test_context();
    let owner = owner();
    let original = "Zhang San works at Huawei";
    let refined = "Zhang San works at Huawei as senior engineer, doing AI algorithms";

    ctx.embedder.register(original, FakeEmbedder::basis(0));
    // Similar but not identical: judge territory (0.80 <= sim < 0.95)
    ctx.embedder.register(refined, FakeEmbedder::blend(0, 1, 0.90));

    let first = ingest_text(&ctx.state, &owner, original).await;
    assert_eq!(first.result.as_ref().unwrap().added, 1);

    // The judge recognizes the same subject and refines it
    let refined_owned = refined.to_string();
    ctx.chat.set_judge(move |_prompt| {
        json!({
            "memory": [{
                "id": "0",
                "text": refined_owned,
                "event": "UPDATE",
                "old_memory": "Zhang San works at Huawei",
                "reason": "more specific: role and focus area"
            }]
        })
        .to_string()
    });

    let second = ingest_text(&ctx.state, &owner, refined).await;
    assert_eq!(second.status, TaskStatus::Success);
    let report = second.result.as_ref().unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.added, 0);

    // Same id, version bumped 1 -> 2, content rewritten
    let (rows, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].version, 2);
    match &rows[0].content {
        StoredContent::Plain(text) => assert!(text.contains("senior engineer")),
        _ => panic!("expected plain content"),
    }

    // Search for the subject returns the updated content
    let query = "Zhang San job";
    ctx.embedder.register(query, FakeEmbedder::blend(0, 1, 0.87));
    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, None)
        .await
        .unwrap();
    assert_eq!(outcome.data.len(), 1);
    assert!(outcome.data[0].content.contains("senior engineer"));
}

#[tokio::test]
async fn negation_deletes_old_fact_and_adds_new_one() {
    let ctx = test_context();
    let owner = owner();
    let beijing = "Zhang San lives in Beijing";
    let shanghai = "Zhang San now lives in Shanghai, not Beijing anymore";

    ctx.embedder.register(beijing, FakeEmbedder::basis(2));
    ctx.embedder.register(shanghai, FakeEmbedder::blend(2, 3, 0.85));

    ingest_text(&ctx.state, &owner, beijing).await;

    let shanghai_owned = shanghai.to_string();
    ctx.chat.set_judge(move |_prompt| {
        json!({
            "memory": [
                {"id": "0", "text": "", "event": "DELETE",
                 "reason": "explicitly negated: not in Beijing anymore"},
                {"id": "1", "text": shanghai_owned, "event": "ADD",
                 "reason": "new location"}
            ]
        })
        .to_string()
    });

    let task = ingest_text(&ctx.state, &owner, shanghai).await;
    assert_eq!(task.status, TaskStatus::Success);
    let report = task.result.as_ref().unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.added, 1);

    // Only the Shanghai fact is live; the Beijing row is tombstoned
    let (rows, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 1);
    match &rows[0].content {
        StoredContent::Plain(text) => assert!(text.contains("Shanghai")),
        _ => panic!("expected plain content"),
    }

    // Search about the subject returns only Shanghai
    let query = "where does Zhang San live";
    ctx.embedder.register(query, FakeEmbedder::blend(2, 3, 0.80));
    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, None)
        .await
        .unwrap();
    assert_eq!(outcome.data.len(), 1);
    assert!(outcome.data[0].content.contains("Shanghai"));
}

#[tokio::test]
async fn graph_follower_failure_is_compensated_and_task_partial() {
    let ctx = test_context();
    let owner = owner();
    let text = "Wang Wu joined Tencent";
    ctx.embedder.register(text, FakeEmbedder::basis(1));

    // An empty entity name makes the graph step fail after the relational
    // row and the vector were written, forcing reverse compensation
    ctx.chat.set_facts(|_prompt| {
        json!({
            "facts": [{
                "text": "Wang Wu joined Tencent",
                "category": "fact",
                "confidence": 0.9,
                "entities": ["Tencent", ""]
            }]
        })
        .to_string()
    });

    let task = ingest_text(&ctx.state, &owner, text).await;
    assert_eq!(task.status, TaskStatus::Partial);
    let report = task.result.as_ref().unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.compensated.len(), 1);

    // Compensation removed the row and the vector: no partial write observable
    let (_, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 0);
    assert_eq!(ctx.state.stores.vector.len(), 0);
}

#[tokio::test]
async fn vector_follower_failure_rolls_back_the_relational_row() {
    let ctx = test_context();
    let owner = owner();

    let fact = memoryx::types::CandidateFact {
        text: "Wang Wu joined Tencent".to_string(),
        category: Category::Fact,
        confidence: 0.9,
        source_id: "test".to_string(),
        entities: vec!["Wang Wu".to_string(), "Tencent".to_string()],
        entity_types: vec![],
        relations: vec![],
    };

    // Wrong-dimension embedding: the vector step rejects it after step 1
    let result = ctx
        .state
        .reconciler
        .saga()
        .commit_add(&owner, &fact, vec![1.0, 0.0]);
    assert!(matches!(
        result,
        Err(memoryx::reconcile::SagaError::Follower { step: "vector", .. })
    ));

    let (_, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn llm_outage_fails_task_without_commit() {
    use memoryx::ingest::{IngestWorker, TrivialFilters};
    use std::sync::Arc;

    let ctx = test_context();
    let owner = owner();

    // A worker whose extractor always fails permanently
    let failing = Arc::new(memoryx::llm::FactExtractor::new(Arc::new(
        common::FailingChat { transient: false },
    )));
    let worker = IngestWorker::new(
        ctx.state.stores.relational.clone(),
        failing,
        ctx.state.reconciler.clone(),
        TrivialFilters::default(),
        std::time::Duration::from_secs(30),
    );

    let task = ctx
        .state
        .queue
        .submit(
            owner.clone(),
            memoryx::types::TaskPayload::Memory {
                content: "Li Si prefers tea".to_string(),
                metadata: None,
            },
        )
        .unwrap();
    worker.process_task(task.clone()).await;

    let finished = ctx.state.queue.get(&task.id).unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Failure);
    assert!(finished.error.as_ref().unwrap().contains("LLM_FAILURE"));

    let (_, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn trivial_content_is_rejected_not_stored() {
    let ctx = test_context();
    let owner = owner();

    // Extractor returns one real fact and two trivial ones
    ctx.chat.set_facts(|_prompt| {
        json!({
            "facts": [
                {"text": "hello", "category": "other", "confidence": 0.2, "entities": []},
                {"text": "Li Si speaks French", "category": "fact", "confidence": 0.9,
                 "entities": ["Li Si", "French"]},
                {"text": "...", "category": "other", "confidence": 0.1, "entities": []}
            ]
        })
        .to_string()
    });

    let task = ingest_text(&ctx.state, &owner, "greeting plus one fact").await;
    assert_eq!(task.status, TaskStatus::Success);
    let report = task.result.as_ref().unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.rejected, 2);

    let (_, total) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn every_live_memory_has_entity_links() {
    let ctx = test_context();
    let owner = owner();
    let text = "Zhao Liu studies Rust at Tsinghua";
    ctx.embedder.register(text, FakeEmbedder::basis(4));

    ingest_text(&ctx.state, &owner, text).await;

    let (rows, _) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    for row in rows {
        let links = ctx
            .state
            .stores
            .graph
            .links_for_memory(&owner, &row.id.0)
            .unwrap();
        assert!(
            !links.is_empty(),
            "live memory {} must link at least one entity",
            row.id
        );
    }
}

#[tokio::test]
async fn drift_sweep_reconciles_followers_to_relational_truth() {
    let ctx = test_context();
    let owner = owner();

    // A healthy memory through the normal path
    let text = "Sun Qi plays badminton";
    ctx.embedder.register(text, FakeEmbedder::basis(5));
    ingest_text(&ctx.state, &owner, text).await;

    // Inject drift, both directions: an orphan vector with no row...
    let orphan = uuid::Uuid::new_v4();
    ctx.state
        .stores
        .vector
        .upsert(
            orphan,
            FakeEmbedder::basis(6),
            VectorPayload {
                owner: owner.clone(),
                category: Category::Fact,
            },
        )
        .unwrap();

    // ...and a relational row whose vector and links are missing
    let bare_id = MemoryId::generate();
    let now = memoryx::chrono::Utc::now();
    let bare_text = "Qian Ba collects stamps";
    ctx.embedder.register(bare_text, FakeEmbedder::basis(7));
    ctx.state
        .stores
        .relational
        .put_memory(&memoryx::types::MemoryRecord {
            id: bare_id,
            owner: owner.clone(),
            content: StoredContent::Plain(bare_text.to_string()),
            category: Category::Fact,
            created_at: now,
            updated_at: now,
            version: 1,
            tombstoned: false,
            sources: vec![],
            entities: vec!["Qian Ba".to_string()],
            relations: vec![],
            metadata: None,
        })
        .unwrap();

    let report = ctx.state.sweeper.sweep_owner(&owner).await.unwrap();
    assert_eq!(report.orphan_vectors, 1);
    assert_eq!(report.missing_vectors, 1);
    assert!(report.missing_links >= 1);

    // Invariant: |live memories| == |vector entries| after the sweep
    let live = ctx.state.stores.relational.count_live_memories(&owner).unwrap();
    let vectors = ctx.state.stores.vector.ids_for_owner(&owner).len() as u64;
    assert_eq!(live, vectors);

    // And the re-linked row satisfies the entity-link invariant
    let links = ctx
        .state
        .stores
        .graph
        .links_for_memory(&owner, &bare_id.0)
        .unwrap();
    assert!(!links.is_empty());
}

#[tokio::test]
async fn content_at_rest_encryption_seals_rows_transparently() {
    let ctx = common::test_context_with(|config| {
        config.content_key =
            Some("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string());
    });
    let owner = owner();
    let text = "Zhang San holds a pilot license";
    ctx.embedder.register(text, FakeEmbedder::basis(0));

    let task = ingest_text(&ctx.state, &owner, text).await;
    assert_eq!(task.status, TaskStatus::Success);

    // The relational row never sees plaintext
    let (rows, _) = ctx.state.stores.relational.list_memories(&owner, 10, 0).unwrap();
    assert!(matches!(rows[0].content, StoredContent::Sealed { .. }));

    // Retrieval decrypts transparently
    let query = "Zhang San license";
    ctx.embedder.register(query, FakeEmbedder::blend(0, 1, 0.9));
    let outcome = ctx
        .state
        .retriever
        .search(&owner, query, 10, None)
        .await
        .unwrap();
    assert_eq!(outcome.data.len(), 1);
    assert!(outcome.data[0].content.contains("pilot license"));

    // Dedup still works against sealed rows (neighbors are decrypted)
    let second = ingest_text(&ctx.state, &owner, text).await;
    assert_eq!(second.result.as_ref().unwrap().noop, 1);
}

#[tokio::test]
async fn owner_partitions_do_not_leak_into_each_other() {
    let ctx = test_context();
    let alice = memoryx::types::OwnerId::new("alice", "default");
    let bob = memoryx::types::OwnerId::new("bob", "default");
    let text = "Alice likes Vim";
    ctx.embedder.register(text, FakeEmbedder::basis(0));

    ingest_text(&ctx.state, &alice, text).await;

    let (_, alice_total) = ctx.state.stores.relational.list_memories(&alice, 10, 0).unwrap();
    let (_, bob_total) = ctx.state.stores.relational.list_memories(&bob, 10, 0).unwrap();
    assert_eq!(alice_total, 1);
    assert_eq!(bob_total, 0);

    ctx.embedder.register("Vim", FakeEmbedder::basis(0));
    let outcome = ctx
        .state
        .retriever
        .search(&bob, "Alice likes Vim", 10, None)
        .await
        .unwrap();
    assert!(outcome.data.is_empty());
}
