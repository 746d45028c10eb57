//! Fact reconciler: decides ADD / UPDATE / DELETE / NOOP for each candidate
//! against the owner's existing memories, then commits across the tri-store
//! via the saga.
//!
//! Per owner partition, reconciliation is serialized by an async mutex so
//! two concurrent candidates cannot both create memories of the same
//! subject. Across owners it runs in parallel, bounded by the worker pool.

pub mod saga;
pub mod sweep;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::ReconcilerThresholds;
use crate::crypto::{open_content, ContentCipher};
use crate::llm::{Embedder, FactExtractor, JudgeEvent, LlmError, NeighborView};
use crate::metrics;
use crate::similarity::{entity_jaccard, entity_sets_equal, lexical_overlap};
use crate::store::graph::GraphStore;
use crate::store::relational::RelationalStore;
use crate::store::vector::VectorIndex;
use crate::types::{CandidateFact, DecisionTrace, IngestReport, MemoryId, OwnerId};

pub use saga::{SagaError, SagaExecutor};
pub use sweep::{DriftSweeper, SweepReport};

/// Neighbors retrieved per candidate for the decision procedure.
const NEIGHBOR_K: usize = 5;
/// Category filter applies when the extractor was at least this confident.
const CATEGORY_CONFIDENCE_FLOOR: f32 = 0.6;

/// Reconciliation failure, classified per the task failure policy.
#[derive(Debug)]
pub enum ReconcileError {
    /// Task deadline exceeded; the in-flight step was compensated.
    Timeout(String),
    /// Authoritative relational step failed; the task fails with no
    /// partial commit for the offending fact.
    Relational(anyhow::Error),
    /// LLM or embedding failure (retried by the task layer if transient).
    Llm(LlmError),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(what) => write!(f, "deadline exceeded at {what}"),
            Self::Relational(e) => write!(f, "relational write failed: {e}"),
            Self::Llm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Deadline carried through a task; checked between saga steps and between
/// candidates so an expired budget triggers the compensation path instead
/// of cancelling mid-write.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn check(&self, what: &str) -> Result<(), ReconcileError> {
        if Instant::now() >= self.at {
            Err(ReconcileError::Timeout(what.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Per-owner async locks serializing reconciliation (and drift sweeping)
/// within a partition. Never held across an await on another owner.
#[derive(Default)]
pub struct OwnerLocks {
    map: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OwnerLocks {
    pub fn lock_for(&self, owner: &OwnerId) -> Arc<tokio::sync::Mutex<()>> {
        self.map
            .lock()
            .entry(owner.partition_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// One decided operation for a candidate.
#[derive(Debug)]
pub enum MemoryOp {
    Add { text: String },
    Update { target: MemoryId, text: String },
    Delete { target: MemoryId },
    Noop { duplicate_of: MemoryId },
}

impl MemoryOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "ADD",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
            Self::Noop { .. } => "NOOP",
        }
    }
}

/// A near neighbor with the three signals the decision procedure uses.
struct Neighbor {
    id: MemoryId,
    text: String,
    similarity: f32,
    lexical: f32,
    jaccard: f32,
    entities: Vec<String>,
}

pub struct Reconciler {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphStore>,
    extractor: Arc<FactExtractor>,
    embedder: Arc<dyn Embedder>,
    thresholds: ReconcilerThresholds,
    cipher: Option<ContentCipher>,
    locks: Arc<OwnerLocks>,
    saga: SagaExecutor,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorIndex>,
        graph: Arc<GraphStore>,
        extractor: Arc<FactExtractor>,
        embedder: Arc<dyn Embedder>,
        thresholds: ReconcilerThresholds,
        cipher: Option<ContentCipher>,
        locks: Arc<OwnerLocks>,
    ) -> Self {
        let saga = SagaExecutor::new(
            relational.clone(),
            vector.clone(),
            graph.clone(),
            cipher.clone(),
        );
        Self {
            relational,
            vector,
            graph,
            extractor,
            embedder,
            thresholds,
            cipher,
            locks,
            saga,
        }
    }

    pub fn locks(&self) -> Arc<OwnerLocks> {
        self.locks.clone()
    }

    /// Reconcile a batch of candidates for one owner, serialized against
    /// other work on the same partition. Candidates are processed in order.
    pub async fn reconcile_batch(
        &self,
        owner: &OwnerId,
        candidates: Vec<CandidateFact>,
        deadline: Deadline,
    ) -> Result<IngestReport, ReconcileError> {
        let lock = self.locks.lock_for(owner);
        let _guard = lock.lock().await;

        let mut report = IngestReport {
            trace_id: Uuid::new_v4(),
            ..Default::default()
        };

        for candidate in candidates {
            deadline.check("candidate")?;

            let embedding = self
                .embedder
                .embed(&candidate.text)
                .await
                .map_err(ReconcileError::Llm)?;

            let neighbors = self.load_neighbors(owner, &candidate, &embedding)?;
            let (ops, path) = self.decide(&candidate, &neighbors, &mut report).await?;

            for op in ops {
                deadline.check("saga step")?;
                metrics::RECONCILE_DECISIONS_TOTAL
                    .with_label_values(&[op.name(), path])
                    .inc();
                self.commit(owner, &candidate, op, &embedding, &mut report)?;
            }
        }

        Ok(report)
    }

    /// Top-k nearest live memories with similarity, lexical overlap and
    /// entity Jaccard computed against the candidate.
    fn load_neighbors(
        &self,
        owner: &OwnerId,
        candidate: &CandidateFact,
        embedding: &[f32],
    ) -> Result<Vec<Neighbor>, ReconcileError> {
        let category_filter = (candidate.confidence >= CATEGORY_CONFIDENCE_FLOOR)
            .then_some(candidate.category);

        let hits = self
            .vector
            .search(owner, category_filter, embedding, NEIGHBOR_K)
            .map_err(ReconcileError::Relational)?;

        let mut neighbors = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(record) = self
                .relational
                .get_memory(owner, &MemoryId(hit.id))
                .map_err(ReconcileError::Relational)?
            else {
                // Inconsistency window: vector present, row missing
                tracing::debug!("Skipping vector hit {} with no relational row", hit.id);
                continue;
            };
            if record.tombstoned {
                continue;
            }
            let text = open_content(self.cipher.as_ref(), &record.content)
                .map_err(ReconcileError::Relational)?;
            neighbors.push(Neighbor {
                id: record.id,
                similarity: hit.score,
                lexical: lexical_overlap(&candidate.text, &text),
                jaccard: entity_jaccard(&candidate.entities, &record.entities),
                entities: record.entities,
                text,
            });
        }
        Ok(neighbors)
    }

    /// The per-candidate decision procedure. Deterministic fast paths avoid
    /// the judge when the answer is unambiguous; otherwise the LLM decides.
    /// Returns the operations plus which path produced them.
    async fn decide(
        &self,
        candidate: &CandidateFact,
        neighbors: &[Neighbor],
        report: &mut IngestReport,
    ) -> Result<(Vec<MemoryOp>, &'static str), ReconcileError> {
        let best = neighbors.first();

        // No sufficiently similar memory: plain ADD
        if best.is_none_or(|n| n.similarity < self.thresholds.add) {
            report.decisions.push(DecisionTrace {
                fact: candidate.text.clone(),
                op: "ADD".to_string(),
                reason: match best {
                    Some(n) => format!("best similarity {:.2} below add threshold", n.similarity),
                    None => "no existing memories".to_string(),
                },
            });
            return Ok((
                vec![MemoryOp::Add {
                    text: candidate.text.clone(),
                }],
                "deterministic",
            ));
        }

        // Exact duplicate: similarity at the noop threshold with the same
        // entity set needs no judge
        let best = best.expect("checked above");
        if best.similarity >= self.thresholds.noop
            && entity_sets_equal(&candidate.entities, &best.entities)
        {
            report.decisions.push(DecisionTrace {
                fact: candidate.text.clone(),
                op: "NOOP".to_string(),
                reason: format!(
                    "duplicate of {} (similarity {:.2}, equal entities)",
                    best.id, best.similarity
                ),
            });
            return Ok((
                vec![MemoryOp::Noop {
                    duplicate_of: best.id,
                }],
                "deterministic",
            ));
        }

        // Ambiguous: ask the judge. Neighbor signals (lexical overlap and
        // entity Jaccard) pick which neighbors are worth showing.
        let views: Vec<NeighborView> = neighbors
            .iter()
            .enumerate()
            .map(|(i, n)| NeighborView {
                id: i.to_string(),
                text: n.text.clone(),
            })
            .collect();
        tracing::debug!(
            "Judging '{}' against {} neighbors (best sim {:.2}, lexical {:.2}, jaccard {:.2})",
            candidate.text,
            neighbors.len(),
            best.similarity,
            best.lexical,
            best.jaccard,
        );

        let judge_ops = self
            .extractor
            .judge(&views, std::slice::from_ref(&candidate.text))
            .await
            .map_err(ReconcileError::Llm)?;

        let mut ops = Vec::new();
        for judge_op in judge_ops {
            let target = judge_op
                .id
                .parse::<usize>()
                .ok()
                .and_then(|i| neighbors.get(i));
            let op = match (judge_op.event, target) {
                (JudgeEvent::Add, _) => {
                    let text = if judge_op.text.trim().is_empty() {
                        candidate.text.clone()
                    } else {
                        judge_op.text.clone()
                    };
                    Some(MemoryOp::Add { text })
                }
                (JudgeEvent::Update, Some(neighbor)) => Some(MemoryOp::Update {
                    target: neighbor.id,
                    text: if judge_op.text.trim().is_empty() {
                        candidate.text.clone()
                    } else {
                        judge_op.text.clone()
                    },
                }),
                (JudgeEvent::Delete, Some(neighbor)) => Some(MemoryOp::Delete {
                    target: neighbor.id,
                }),
                (JudgeEvent::None, Some(neighbor)) => Some(MemoryOp::Noop {
                    duplicate_of: neighbor.id,
                }),
                // UPDATE/DELETE/NONE pointing at an unknown slot: ignore
                _ => None,
            };
            if let Some(op) = op {
                // NONE verdicts about untouched neighbors are not noops of
                // the candidate; only record them when they are the sole
                // verdict (pure duplicate)
                report.decisions.push(DecisionTrace {
                    fact: candidate.text.clone(),
                    op: op.name().to_string(),
                    reason: judge_op.reason.clone(),
                });
                ops.push(op);
            }
        }

        // NONE rows about neighbors the candidate leaves untouched are not
        // noops of the candidate itself; they only count when the judge
        // returned nothing but NONE (pure duplicate). An empty verdict
        // list defaults to ADD so ingestion stays lossless.
        let touches_candidate = ops
            .iter()
            .any(|op| !matches!(op, MemoryOp::Noop { .. }));
        if ops.is_empty() {
            report.decisions.push(DecisionTrace {
                fact: candidate.text.clone(),
                op: "ADD".to_string(),
                reason: "judge returned no operations".to_string(),
            });
            ops.push(MemoryOp::Add {
                text: candidate.text.clone(),
            });
        } else if touches_candidate {
            ops.retain(|op| !matches!(op, MemoryOp::Noop { .. }));
        } else {
            // All verdicts were NONE: keep exactly one noop
            let first = ops.remove(0);
            ops = vec![first];
        }

        Ok((ops, "judge"))
    }

    /// Commit one operation through the saga, folding the outcome into the
    /// report per the failure policy.
    fn commit(
        &self,
        owner: &OwnerId,
        candidate: &CandidateFact,
        op: MemoryOp,
        embedding: &[f32],
        report: &mut IngestReport,
    ) -> Result<(), ReconcileError> {
        let outcome: Result<(), SagaError> = match op {
            MemoryOp::Add { text } => {
                let fact = CandidateFact {
                    text,
                    ..candidate.clone()
                };
                self.saga
                    .commit_add(owner, &fact, embedding.to_vec())
                    .map(|_| report.added += 1)
            }
            MemoryOp::Update { target, text } => {
                let fact = CandidateFact {
                    text,
                    ..candidate.clone()
                };
                self.saga
                    .commit_update(owner, &target, &fact, embedding.to_vec())
                    .map(|_| report.updated += 1)
            }
            MemoryOp::Delete { target } => self
                .saga
                .commit_delete(owner, &target)
                .map(|_| report.deleted += 1),
            MemoryOp::Noop { .. } => {
                report.noop += 1;
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            // Authoritative failure aborts the task
            Err(SagaError::Relational(e)) => Err(ReconcileError::Relational(e)),
            // Follower failure was compensated; note the fact, keep going
            Err(SagaError::Follower { step, source }) => {
                tracing::warn!(
                    "Follower {} step compensated for '{}': {}",
                    step,
                    candidate.text,
                    source
                );
                report.compensated.push(candidate.text.clone());
                Ok(())
            }
        }
    }

    /// Direct lookup used by handlers (single delete endpoint).
    pub fn saga(&self) -> &SagaExecutor {
        &self.saga
    }

    /// Graph handle for the community job.
    pub fn graph(&self) -> Arc<GraphStore> {
        self.graph.clone()
    }
}
