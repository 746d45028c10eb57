//! GraphRAG retriever: vector recall fused with entity-graph expansion and
//! temporal decay.
//!
//! `score = alpha * sim + beta * graph_boost + gamma * temporal_decay`.
//! Expansion walks memory -> entity -> relation -> entity -> memory up to
//! depth 2; each hop discounts by 0.5 times the edge weight normalized by
//! the entity's total adjacent weight. Cycles are cut by a visited set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RetrievalWeights;
use crate::crypto::{open_content, ContentCipher};
use crate::decay::temporal_decay;
use crate::errors::{AppError, Result};
use crate::llm::{Embedder, FactExtractor};
use crate::metrics;
use crate::store::graph::GraphStore;
use crate::store::relational::RelationalStore;
use crate::store::vector::VectorIndex;
use crate::types::{Category, MemoryId, OwnerId};
use crate::validation::MIN_QUERY_LENGTH;

/// Recall width: `max(limit * RECALL_FACTOR, RECALL_FLOOR)` candidates.
const RECALL_FACTOR: usize = 3;
const RECALL_FLOOR: usize = 30;
/// Per-hop score discount during graph expansion.
const HOP_DISCOUNT: f32 = 0.5;
/// Graph-boost bonus for memories inside the query's communities.
const COMMUNITY_BONUS: f32 = 0.1;

/// One ranked result.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub id: MemoryId,
    pub content: String,
    pub category: Category,
    pub score: f32,
}

/// Retrieval output: direct matches plus graph-adjacent runners-up.
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub data: Vec<ScoredMemory>,
    pub related: Vec<ScoredMemory>,
}

pub struct Retriever {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphStore>,
    extractor: Arc<FactExtractor>,
    embedder: Arc<dyn Embedder>,
    weights: RetrievalWeights,
    cipher: Option<ContentCipher>,
}

impl Retriever {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorIndex>,
        graph: Arc<GraphStore>,
        extractor: Arc<FactExtractor>,
        embedder: Arc<dyn Embedder>,
        weights: RetrievalWeights,
        cipher: Option<ContentCipher>,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            extractor,
            embedder,
            weights,
            cipher,
        }
    }

    /// Search one owner partition. Quota accounting happens in the handler;
    /// this layer only ranks.
    pub async fn search(
        &self,
        owner: &OwnerId,
        query: &str,
        limit: usize,
        category: Option<Category>,
    ) -> Result<RetrievalOutcome> {
        let start = std::time::Instant::now();

        if query.trim().chars().count() < MIN_QUERY_LENGTH {
            return Ok(RetrievalOutcome::default());
        }

        // Query analysis: entity extraction with the ingestion extractor.
        // An LLM outage degrades to pure vector recall.
        let query_entities = match self.extractor.extract_graph(query, &owner.user_id).await {
            Ok(graph) => graph.entities,
            Err(e) => {
                tracing::debug!("Query entity extraction unavailable: {}", e);
                Vec::new()
            }
        };

        // Community prefilter: entity ids inside the query's communities
        let community_members = self.resolve_communities(owner, &query_entities)?;

        // Vector recall
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        let k = (limit * RECALL_FACTOR).max(RECALL_FLOOR);
        let hits = self
            .vector
            .search(owner, category, &embedding, k)
            .map_err(|e| AppError::StorageError(e.to_string()))?;

        let direct: Vec<(Uuid, f32)> = hits.iter().map(|h| (h.id, h.score)).collect();
        let direct_ids: HashSet<Uuid> = direct.iter().map(|(id, _)| *id).collect();

        // Graph expansion, skipped when the query resolved no entities
        let graph_scores = if query_entities.is_empty() {
            HashMap::new()
        } else {
            self.expand(owner, &direct)?
        };

        // Score and merge: direct hits plus adjacent-only candidates
        let now = chrono::Utc::now();
        let mut scored: Vec<(ScoredMemory, bool)> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();

        let candidates = direct
            .iter()
            .map(|(id, sim)| (*id, Some(*sim)))
            .chain(graph_scores.keys().map(|id| (*id, None)));

        for (id, direct_sim) in candidates {
            if !seen.insert(id) {
                continue;
            }
            let memory_id = MemoryId(id);
            let Some(record) = self
                .relational
                .get_memory(owner, &memory_id)
                .map_err(|e| AppError::StorageError(e.to_string()))?
            else {
                // Inconsistency window: vector or link without a row
                tracing::debug!("Skipping {} during search: no relational row", id);
                continue;
            };
            // Tombstoned memories are filtered out post-rank
            if record.tombstoned {
                continue;
            }
            if let Some(filter) = category {
                if record.category != filter {
                    continue;
                }
            }

            // Adjacent-only candidates get their similarity from the index
            let sim = match direct_sim {
                Some(sim) => sim,
                None => self
                    .vector
                    .get(&id)
                    .map(|(vec, _)| crate::similarity::cosine_similarity(&embedding, &vec))
                    .unwrap_or(0.0),
            };

            let mut graph_boost = graph_scores.get(&id).copied().unwrap_or(0.0);
            if !community_members.is_empty() {
                let links = self
                    .graph
                    .links_for_memory(owner, &id)
                    .map_err(|e| AppError::StorageError(e.to_string()))?;
                if links.iter().any(|e| community_members.contains(e)) {
                    graph_boost += COMMUNITY_BONUS;
                }
            }
            let decay = temporal_decay(record.updated_at, now, self.weights.tau_days);

            let score = self.weights.alpha * sim
                + self.weights.beta * graph_boost.min(1.0)
                + self.weights.gamma * decay;

            let content = open_content(self.cipher.as_ref(), &record.content)
                .map_err(|e| AppError::StorageError(e.to_string()))?;
            scored.push((
                ScoredMemory {
                    id: memory_id,
                    content,
                    category: record.category,
                    score,
                },
                direct_ids.contains(&id),
            ));
        }

        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Top `limit` overall in data; next best adjacent-only as related
        let mut outcome = RetrievalOutcome::default();
        for (memory, is_direct) in scored {
            if outcome.data.len() < limit {
                outcome.data.push(memory);
            } else if !is_direct && outcome.related.len() < limit {
                outcome.related.push(memory);
            }
        }

        metrics::SEARCH_DURATION.observe(start.elapsed().as_secs_f64());
        metrics::SEARCH_TOTAL
            .with_label_values(&[if outcome.data.is_empty() { "empty" } else { "ok" }])
            .inc();

        Ok(outcome)
    }

    /// Entity ids belonging to the communities of the query's entities.
    fn resolve_communities(
        &self,
        owner: &OwnerId,
        query_entities: &[(String, crate::store::graph::EntityLabel)],
    ) -> Result<HashSet<Uuid>> {
        let mut community_ids = HashSet::new();
        for (name, _) in query_entities {
            if let Some(entity) = self
                .graph
                .entity_by_name(owner, name)
                .map_err(|e| AppError::StorageError(e.to_string()))?
            {
                if let Some(community) = entity.community {
                    community_ids.insert(community);
                }
            }
        }
        if community_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut members = HashSet::new();
        for community in self
            .graph
            .communities(owner)
            .map_err(|e| AppError::StorageError(e.to_string()))?
        {
            if community_ids.contains(&community.id) {
                members.extend(community.entity_ids);
            }
        }
        Ok(members)
    }

    /// Depth-2 expansion from each recalled memory, collecting adjacent
    /// memory ids with discounted scores.
    fn expand(&self, owner: &OwnerId, recalled: &[(Uuid, f32)]) -> Result<HashMap<Uuid, f32>> {
        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        let store_err = |e: anyhow::Error| AppError::StorageError(e.to_string());

        for (memory, sim) in recalled {
            let start_entities = self
                .graph
                .links_for_memory(owner, memory)
                .map_err(store_err)?;
            let mut visited: HashSet<Uuid> = start_entities.iter().copied().collect();

            // Memories sharing an entity with the recalled memory (hop 1)
            let mut frontier: Vec<(Uuid, f32)> = Vec::new();
            for entity in &start_entities {
                for adjacent in self
                    .graph
                    .memories_for_entity(owner, entity)
                    .map_err(store_err)?
                {
                    if adjacent != *memory {
                        let boost = sim * HOP_DISCOUNT;
                        scores
                            .entry(adjacent)
                            .and_modify(|s| *s = s.max(boost))
                            .or_insert(boost);
                    }
                }
                frontier.push((*entity, 1.0));
            }

            // Entity-to-entity hops with weight-normalized discounts
            for hop in 1..=2usize {
                let mut next = Vec::new();
                for (entity, factor) in &frontier {
                    let total = self.graph.total_weight(owner, entity).map_err(store_err)?;
                    if total <= 0.0 {
                        continue;
                    }
                    for (neighbor, weight) in
                        self.graph.neighbors(owner, entity).map_err(store_err)?
                    {
                        if !visited.insert(neighbor) {
                            continue;
                        }
                        let discounted = factor * HOP_DISCOUNT * (weight / total);
                        for adjacent in self
                            .graph
                            .memories_for_entity(owner, &neighbor)
                            .map_err(store_err)?
                        {
                            if adjacent != *memory {
                                let boost = sim * discounted;
                                scores
                                    .entry(adjacent)
                                    .and_modify(|s| *s = s.max(boost))
                                    .or_insert(boost);
                            }
                        }
                        next.push((neighbor, discounted));
                    }
                }
                if next.is_empty() || hop == 2 {
                    break;
                }
                frontier = next;
            }
        }

        Ok(scores)
    }
}
