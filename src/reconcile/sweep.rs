//! Drift sweep: periodic reconciliation of the follower stores against
//! relational truth.
//!
//! Per owner partition the sweep deletes orphaned vectors and graph links,
//! re-embeds rows whose vectors went missing and re-links rows whose links
//! did. The per-owner lock is taken in brief spans over batches of 100
//! memories so reconciliation is never starved.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{open_content, ContentCipher};
use crate::llm::Embedder;
use crate::metrics;
use crate::reconcile::OwnerLocks;
use crate::store::graph::{EntityLabel, GraphStore};
use crate::store::relational::RelationalStore;
use crate::store::vector::{VectorIndex, VectorPayload};
use crate::types::{MemoryRecord, OwnerId};

/// Memories handled per lock span.
const SWEEP_BATCH: usize = 100;

/// What one sweep pass repaired.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub orphan_vectors: usize,
    pub missing_vectors: usize,
    pub orphan_links: usize,
    pub missing_links: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.orphan_vectors + self.missing_vectors + self.orphan_links + self.missing_links
    }

    fn merge(&mut self, other: SweepReport) {
        self.orphan_vectors += other.orphan_vectors;
        self.missing_vectors += other.missing_vectors;
        self.orphan_links += other.orphan_links;
        self.missing_links += other.missing_links;
    }
}

pub struct DriftSweeper {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphStore>,
    embedder: Arc<dyn Embedder>,
    cipher: Option<ContentCipher>,
    locks: Arc<OwnerLocks>,
}

impl DriftSweeper {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorIndex>,
        graph: Arc<GraphStore>,
        embedder: Arc<dyn Embedder>,
        cipher: Option<ContentCipher>,
        locks: Arc<OwnerLocks>,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            embedder,
            cipher,
            locks,
        }
    }

    /// Sweep every owner partition. Errors in one partition are logged and
    /// do not stop the others.
    pub async fn sweep_all(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for owner in self.relational.owner_partitions()? {
            match self.sweep_owner(&owner).await {
                Ok(partial) => report.merge(partial),
                Err(e) => tracing::warn!("Drift sweep failed for {}: {}", owner, e),
            }
        }
        if report.total() > 0 {
            tracing::info!(
                "Drift sweep repaired {} entries (vectors: -{} +{}, links: -{} +{})",
                report.total(),
                report.orphan_vectors,
                report.missing_vectors,
                report.orphan_links,
                report.missing_links,
            );
        }
        Ok(report)
    }

    /// Sweep one owner partition.
    pub async fn sweep_owner(&self, owner: &OwnerId) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let lock = self.locks.lock_for(owner);

        // Snapshot relational truth under the lock
        let rows = {
            let _guard = lock.lock().await;
            self.relational.iter_memories(owner)?
        };
        let live: Vec<&MemoryRecord> = rows.iter().filter(|m| !m.tombstoned).collect();
        let live_ids: HashSet<Uuid> = live.iter().map(|m| m.id.0).collect();

        // Orphaned vectors: indexed but not live relationally
        {
            let _guard = lock.lock().await;
            for id in self.vector.ids_for_owner(owner) {
                if !live_ids.contains(&id) {
                    self.vector.delete(&id)?;
                    metrics::DRIFT_REPAIRS_TOTAL
                        .with_label_values(&["orphan_vector"])
                        .inc();
                    report.orphan_vectors += 1;
                }
            }
        }

        // Orphaned links: linked memories that are not live
        {
            let _guard = lock.lock().await;
            for (memory, entity) in self.graph.all_links(owner)? {
                if !live_ids.contains(&memory) {
                    self.graph.unlink_memory(owner, &memory, &entity)?;
                    let _ = self.graph.remove_if_orphan(owner, &entity);
                    metrics::DRIFT_REPAIRS_TOTAL
                        .with_label_values(&["orphan_link"])
                        .inc();
                    report.orphan_links += 1;
                }
            }
        }

        // Missing vectors and links, in bounded lock spans
        for batch in live.chunks(SWEEP_BATCH) {
            // Embeddings happen outside the lock; they are slow I/O
            let mut reembedded: HashMap<Uuid, Vec<f32>> = HashMap::new();
            for record in batch {
                if !self.vector.contains(&record.id.0) {
                    let text = open_content(self.cipher.as_ref(), &record.content)?;
                    match self.embedder.embed(&text).await {
                        Ok(embedding) => {
                            reembedded.insert(record.id.0, embedding);
                        }
                        Err(e) => {
                            tracing::warn!("Re-embedding {} failed: {}", record.id, e);
                        }
                    }
                }
            }

            let _guard = lock.lock().await;
            for record in batch {
                if let Some(embedding) = reembedded.remove(&record.id.0) {
                    self.vector.upsert(
                        record.id.0,
                        embedding,
                        VectorPayload {
                            owner: owner.clone(),
                            category: record.category,
                        },
                    )?;
                    metrics::DRIFT_REPAIRS_TOTAL
                        .with_label_values(&["missing_vector"])
                        .inc();
                    report.missing_vectors += 1;
                }

                // Re-link entities named by the row but not linked in the graph
                let linked: HashSet<Uuid> = self
                    .graph
                    .links_for_memory(owner, &record.id.0)?
                    .into_iter()
                    .collect();
                for name in &record.entities {
                    let entity = self
                        .graph
                        .upsert_entity(owner, name, EntityLabel::Other)?;
                    if !linked.contains(&entity) {
                        self.graph.link_memory(owner, &record.id.0, &entity)?;
                        metrics::DRIFT_REPAIRS_TOTAL
                            .with_label_values(&["missing_link"])
                            .inc();
                        report.missing_links += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}
