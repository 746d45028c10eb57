//! Per-memory saga: the three-step commit across the tri-store with
//! compensation on partial failure.
//!
//! Step order is relational -> vector -> graph. If a step fails, the steps
//! already committed for THIS candidate are compensated in reverse order
//! before the error propagates. The relational store is authoritative: a
//! failure there aborts with no partial commit; a follower failure is
//! compensated locally and surfaces as PARTIAL, with the drift sweep as the
//! backstop if a compensation itself fails.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{seal_content, ContentCipher};
use crate::metrics;
use crate::store::graph::{EntityLabel, GraphStore};
use crate::store::relational::RelationalStore;
use crate::store::vector::{VectorIndex, VectorPayload};
use crate::types::{CandidateFact, MemoryId, MemoryRecord, OwnerId};

/// Saga failure, classified by which step broke.
#[derive(Debug)]
pub enum SagaError {
    /// The authoritative relational step failed; nothing was committed.
    Relational(anyhow::Error),
    /// A follower step failed; earlier steps were compensated.
    Follower {
        step: &'static str,
        source: anyhow::Error,
    },
}

impl fmt::Display for SagaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational(e) => write!(f, "relational step failed: {e}"),
            Self::Follower { step, source } => {
                write!(f, "{step} step failed (compensated): {source}")
            }
        }
    }
}

impl std::error::Error for SagaError {}

/// Executes the tri-store commit for one decided operation.
pub struct SagaExecutor {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphStore>,
    cipher: Option<ContentCipher>,
}

impl SagaExecutor {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorIndex>,
        graph: Arc<GraphStore>,
        cipher: Option<ContentCipher>,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            cipher,
        }
    }

    fn label_for(fact: &CandidateFact, name: &str) -> EntityLabel {
        fact.entity_types
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, t)| EntityLabel::parse(t))
            .unwrap_or(EntityLabel::Other)
    }

    /// Graph step shared by ADD and UPDATE: resolve entities, point the
    /// memory's links at them, bump relation weights. Self-compensating on
    /// partial failure: restores the previous link set and takes back any
    /// weight already added before returning the error.
    fn apply_graph(
        &self,
        owner: &OwnerId,
        memory: &Uuid,
        fact: &CandidateFact,
    ) -> Result<Vec<Uuid>> {
        let mut entity_ids = Vec::new();
        for name in &fact.entities {
            let id = self
                .graph
                .upsert_entity(owner, name, Self::label_for(fact, name))?;
            if !entity_ids.contains(&id) {
                entity_ids.push(id);
            }
        }

        let old_links = self.graph.replace_links(owner, memory, &entity_ids)?;

        let mut bumped: Vec<(Uuid, Uuid, String)> = Vec::new();
        for triple in &fact.relations {
            let result = (|| -> Result<(Uuid, Uuid)> {
                let src = self.graph.upsert_entity(
                    owner,
                    &triple.source,
                    Self::label_for(fact, &triple.source),
                )?;
                let dst = self.graph.upsert_entity(
                    owner,
                    &triple.target,
                    Self::label_for(fact, &triple.target),
                )?;
                self.graph
                    .bump_relation(owner, &src, &dst, &triple.predicate, 1.0)?;
                Ok((src, dst))
            })();

            match result {
                Ok((src, dst)) => bumped.push((src, dst, triple.predicate.clone())),
                Err(e) => {
                    for (src, dst, predicate) in &bumped {
                        if let Err(c) =
                            self.graph.weaken_relation(owner, src, dst, predicate, 1.0)
                        {
                            tracing::warn!("Relation compensation failed: {}", c);
                        }
                    }
                    if let Err(c) = self.graph.replace_links(owner, memory, &old_links) {
                        tracing::warn!(
                            "Link compensation failed (drift sweep will reconcile): {}",
                            c
                        );
                    }
                    return Err(e);
                }
            }
        }

        Ok(old_links)
    }

    /// ADD: new relational row (version 1) -> vector upsert -> entities + links.
    pub fn commit_add(
        &self,
        owner: &OwnerId,
        fact: &CandidateFact,
        embedding: Vec<f32>,
    ) -> Result<MemoryId, SagaError> {
        let now = Utc::now();
        let id = MemoryId::generate();

        // Step 1: authoritative row
        let content = seal_content(self.cipher.as_ref(), &fact.text).map_err(SagaError::Relational)?;
        let record = MemoryRecord {
            id,
            owner: owner.clone(),
            content,
            category: fact.category,
            created_at: now,
            updated_at: now,
            version: 1,
            tombstoned: false,
            sources: vec![fact.source_id.clone()],
            entities: fact.entities.clone(),
            relations: fact.relations.clone(),
            metadata: None,
        };
        self.relational
            .put_memory(&record)
            .map_err(SagaError::Relational)?;

        // Step 2: vector
        let payload = VectorPayload {
            owner: owner.clone(),
            category: fact.category,
        };
        if let Err(e) = self.vector.upsert(id.0, embedding, payload) {
            metrics::SAGA_COMPENSATIONS_TOTAL
                .with_label_values(&["vector"])
                .inc();
            let _ = self.relational.remove_memory(owner, &id);
            return Err(SagaError::Follower {
                step: "vector",
                source: e,
            });
        }

        // Step 3: graph (self-compensates its own partial work)
        if let Err(e) = self.apply_graph(owner, &id.0, fact) {
            metrics::SAGA_COMPENSATIONS_TOTAL
                .with_label_values(&["graph"])
                .inc();
            let _ = self.vector.delete(&id.0);
            let _ = self.relational.remove_memory(owner, &id);
            return Err(SagaError::Follower {
                step: "graph",
                source: e,
            });
        }

        Ok(id)
    }

    /// UPDATE: supersede the row (same id, version + 1, rewritten content),
    /// re-embed, re-point the links at the new entity set.
    pub fn commit_update(
        &self,
        owner: &OwnerId,
        target: &MemoryId,
        fact: &CandidateFact,
        embedding: Vec<f32>,
    ) -> Result<(), SagaError> {
        let previous = self
            .relational
            .get_memory(owner, target)
            .map_err(SagaError::Relational)?
            .ok_or_else(|| SagaError::Relational(anyhow!("update target {target} not found")))?;

        // Step 1: authoritative row, superseding the previous version
        let content = seal_content(self.cipher.as_ref(), &fact.text).map_err(SagaError::Relational)?;
        let mut record = previous.clone();
        record.content = content;
        record.category = fact.category;
        record.version = previous.version + 1;
        record.updated_at = Utc::now();
        record.entities = fact.entities.clone();
        record.relations = fact.relations.clone();
        if !record.sources.contains(&fact.source_id) {
            record.sources.push(fact.source_id.clone());
        }
        self.relational
            .put_memory(&record)
            .map_err(SagaError::Relational)?;

        // Step 2: vector, keeping the old entry for compensation
        let old_vector = self.vector.get(&target.0);
        let payload = VectorPayload {
            owner: owner.clone(),
            category: fact.category,
        };
        if let Err(e) = self.vector.upsert(target.0, embedding, payload) {
            metrics::SAGA_COMPENSATIONS_TOTAL
                .with_label_values(&["vector"])
                .inc();
            let _ = self.relational.put_memory(&previous);
            return Err(SagaError::Follower {
                step: "vector",
                source: e,
            });
        }

        // Step 3: graph links replaced to match the new entity set
        match self.apply_graph(owner, &target.0, fact) {
            Ok(_old_links) => Ok(()),
            Err(e) => {
                metrics::SAGA_COMPENSATIONS_TOTAL
                    .with_label_values(&["graph"])
                    .inc();
                if let Some((vec, payload)) = old_vector {
                    let _ = self.vector.upsert(target.0, vec, payload);
                } else {
                    let _ = self.vector.delete(&target.0);
                }
                let _ = self.relational.put_memory(&previous);
                Err(SagaError::Follower {
                    step: "graph",
                    source: e,
                })
            }
        }
    }

    /// DELETE: tombstone the row, drop the vector, remove links and take
    /// back relation weight. Orphaned entities are cleaned up best-effort.
    pub fn commit_delete(&self, owner: &OwnerId, target: &MemoryId) -> Result<(), SagaError> {
        let previous = self
            .relational
            .get_memory(owner, target)
            .map_err(SagaError::Relational)?
            .ok_or_else(|| SagaError::Relational(anyhow!("delete target {target} not found")))?;

        // Step 1: tombstone
        let mut record = previous.clone();
        record.tombstoned = true;
        record.updated_at = Utc::now();
        self.relational
            .put_memory(&record)
            .map_err(SagaError::Relational)?;

        // Step 2: vector
        let old_vector = match self.vector.delete(&target.0) {
            Ok(old) => old,
            Err(e) => {
                metrics::SAGA_COMPENSATIONS_TOTAL
                    .with_label_values(&["vector"])
                    .inc();
                let _ = self.relational.put_memory(&previous);
                return Err(SagaError::Follower {
                    step: "vector",
                    source: e,
                });
            }
        };

        // Step 3: unlink and decrement relation weights
        let unlink = || -> Result<Vec<Uuid>> {
            let old_links = self.graph.replace_links(owner, &target.0, &[])?;
            for triple in &previous.relations {
                let src = self.graph.entity_by_name(owner, &triple.source)?;
                let dst = self.graph.entity_by_name(owner, &triple.target)?;
                if let (Some(src), Some(dst)) = (src, dst) {
                    self.graph
                        .weaken_relation(owner, &src.id, &dst.id, &triple.predicate, 1.0)?;
                }
            }
            Ok(old_links)
        };
        match unlink() {
            Ok(old_links) => {
                // Entities left without links or relations can go
                for entity in old_links {
                    let _ = self.graph.remove_if_orphan(owner, &entity);
                }
                Ok(())
            }
            Err(e) => {
                metrics::SAGA_COMPENSATIONS_TOTAL
                    .with_label_values(&["graph"])
                    .inc();
                if let Some((vec, payload)) = old_vector {
                    let _ = self.vector.upsert(target.0, vec, payload);
                }
                let _ = self.relational.put_memory(&previous);
                Err(SagaError::Follower {
                    step: "graph",
                    source: e,
                })
            }
        }
    }
}
