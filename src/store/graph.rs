//! Entity graph store: entities, weighted relations, memory-entity links
//! and communities, persisted in RocksDB per owner partition.
//!
//! Entities are created lazily on first reference and deduplicated by
//! canonical name within an owner partition. Relation weight accumulates on
//! repeated co-mention. The graph may contain cycles; traversal is bounded
//! by depth with visited-set tracking, never by reachability.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use petgraph::graph::UnGraph;
use petgraph::visit::EdgeRef;
use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::OwnerId;

/// Entity type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityLabel {
    Person,
    Organization,
    Location,
    Technology,
    Concept,
    Event,
    Item,
    Skill,
    Other,
}

impl EntityLabel {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => Self::Person,
            "organization" | "org" => Self::Organization,
            "location" | "place" => Self::Location,
            "technology" | "tech" | "tool" => Self::Technology,
            "concept" => Self::Concept,
            "event" => Self::Event,
            "item" | "object" | "hobby" => Self::Item,
            "skill" => Self::Skill,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Technology => "technology",
            Self::Concept => "concept",
            Self::Event => "event",
            Self::Item => "item",
            Self::Skill => "skill",
            Self::Other => "other",
        }
    }
}

/// A referent extracted from fact text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    /// Display form as first seen.
    pub name: String,
    /// Alternate surface forms observed later.
    pub aliases: Vec<String>,
    pub label: EntityLabel,
    pub mention_count: u32,
    /// Degree centrality in [0, 1]; recomputed lazily by the community job.
    pub centrality: f32,
    pub community: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Directed edge between two entities. Weight accumulates on co-mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source: Uuid,
    pub target: Uuid,
    pub predicate: String,
    pub weight: f32,
    pub updated_at: DateTime<Utc>,
}

/// A cluster of densely connected entities with a short summary, used as a
/// coarse retrieval prefilter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: u32,
    pub entity_ids: Vec<Uuid>,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
}

/// Canonical form used for the per-owner uniqueness index.
pub fn canonical_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn sync_writes() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

pub struct GraphStore {
    db: Arc<DB>,
}

impl GraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = Arc::new(DB::open(&opts, path)?);
        Ok(Self { db })
    }

    fn put_row<T: Serialize>(&self, key: &str, row: &T) -> Result<()> {
        let value = bincode::serialize(row).context("serialize graph row")?;
        self.db
            .put_opt(key.as_bytes(), value, &sync_writes())
            .with_context(|| format!("put graph row {key}"))?;
        Ok(())
    }

    fn get_row<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(
                bincode::deserialize(&value).with_context(|| format!("deserialize {key}"))?,
            )),
            None => Ok(None),
        }
    }

    fn delete_row(&self, key: &str) -> Result<()> {
        self.db
            .delete_opt(key.as_bytes(), &sync_writes())
            .with_context(|| format!("delete graph row {key}"))?;
        Ok(())
    }

    /// Keys under a prefix (for marker rows where the key is the data).
    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn scan_rows<T: for<'de> Deserialize<'de>>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match bincode::deserialize(&value) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!("Skipping undecodable graph row: {}", e),
            }
        }
        Ok(rows)
    }

    // =========================================================================
    // Entities
    // =========================================================================

    fn entity_key(owner: &OwnerId, id: &Uuid) -> String {
        format!("ent:{}:{}", owner.partition_key(), id)
    }

    fn name_key(owner: &OwnerId, canonical: &str) -> String {
        format!("name:{}:{}", owner.partition_key(), canonical)
    }

    /// Resolve a name to an entity id, creating the entity on first
    /// reference. Canonical names are unique per owner partition; a
    /// different surface form of a known entity is recorded as an alias.
    pub fn upsert_entity(&self, owner: &OwnerId, name: &str, label: EntityLabel) -> Result<Uuid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("entity name cannot be empty"));
        }
        let canonical = canonical_name(name);
        let name_key = Self::name_key(owner, &canonical);

        if let Some(id_str) = self.db.get(name_key.as_bytes())? {
            let id = Uuid::parse_str(&String::from_utf8_lossy(&id_str))
                .context("corrupt entity name index")?;
            if let Some(mut entity) = self.get_row::<Entity>(&Self::entity_key(owner, &id))? {
                entity.mention_count += 1;
                entity.last_seen_at = Utc::now();
                if entity.name != name && !entity.aliases.iter().any(|a| a == name) {
                    entity.aliases.push(name.to_string());
                }
                self.put_row(&Self::entity_key(owner, &id), &entity)?;
            }
            return Ok(id);
        }

        let now = Utc::now();
        let entity = Entity {
            id: Uuid::new_v4(),
            name: name.to_string(),
            aliases: Vec::new(),
            label,
            mention_count: 1,
            centrality: 0.0,
            community: None,
            created_at: now,
            last_seen_at: now,
        };
        self.put_row(&Self::entity_key(owner, &entity.id), &entity)?;
        self.db
            .put_opt(
                name_key.as_bytes(),
                entity.id.to_string().as_bytes(),
                &sync_writes(),
            )
            .context("put entity name index")?;
        Ok(entity.id)
    }

    pub fn entity(&self, owner: &OwnerId, id: &Uuid) -> Result<Option<Entity>> {
        self.get_row(&Self::entity_key(owner, id))
    }

    pub fn entity_by_name(&self, owner: &OwnerId, name: &str) -> Result<Option<Entity>> {
        let canonical = canonical_name(name);
        match self.db.get(Self::name_key(owner, &canonical).as_bytes())? {
            Some(id_str) => {
                let id = Uuid::parse_str(&String::from_utf8_lossy(&id_str))
                    .context("corrupt entity name index")?;
                self.entity(owner, &id)
            }
            None => Ok(None),
        }
    }

    pub fn entities_for_owner(&self, owner: &OwnerId) -> Result<Vec<Entity>> {
        self.scan_rows(&format!("ent:{}:", owner.partition_key()))
    }

    /// Delete an entity that has no remaining links and no relations.
    /// Returns whether it was removed.
    pub fn remove_if_orphan(&self, owner: &OwnerId, id: &Uuid) -> Result<bool> {
        if !self.memories_for_entity(owner, id)?.is_empty() {
            return Ok(false);
        }
        if !self.neighbors(owner, id)?.is_empty() {
            return Ok(false);
        }
        if let Some(entity) = self.entity(owner, id)? {
            self.delete_row(&Self::entity_key(owner, id))?;
            self.delete_row(&Self::name_key(owner, &canonical_name(&entity.name)))?;
            return Ok(true);
        }
        Ok(false)
    }

    // =========================================================================
    // Relations
    // =========================================================================

    fn relation_key(owner: &OwnerId, src: &Uuid, dst: &Uuid, predicate: &str) -> String {
        format!("rel:{}:{}:{}:{}", owner.partition_key(), src, dst, predicate)
    }

    fn reverse_relation_key(owner: &OwnerId, src: &Uuid, dst: &Uuid, predicate: &str) -> String {
        format!("radj:{}:{}:{}:{}", owner.partition_key(), dst, src, predicate)
    }

    /// Add weight to a relation, creating it if absent, and refresh its
    /// timestamp. Weight accumulates on repeated co-mention.
    pub fn bump_relation(
        &self,
        owner: &OwnerId,
        src: &Uuid,
        dst: &Uuid,
        predicate: &str,
        delta: f32,
    ) -> Result<()> {
        let key = Self::relation_key(owner, src, dst, predicate);
        let mut relation = self.get_row::<Relation>(&key)?.unwrap_or(Relation {
            source: *src,
            target: *dst,
            predicate: predicate.to_string(),
            weight: 0.0,
            updated_at: Utc::now(),
        });
        relation.weight += delta;
        relation.updated_at = Utc::now();

        self.put_row(&key, &relation)?;
        self.put_row(
            &Self::reverse_relation_key(owner, src, dst, predicate),
            &relation,
        )?;
        Ok(())
    }

    /// Decrement a relation's weight; the edge is dropped at zero or below.
    pub fn weaken_relation(
        &self,
        owner: &OwnerId,
        src: &Uuid,
        dst: &Uuid,
        predicate: &str,
        delta: f32,
    ) -> Result<()> {
        let key = Self::relation_key(owner, src, dst, predicate);
        let Some(mut relation) = self.get_row::<Relation>(&key)? else {
            return Ok(());
        };
        relation.weight -= delta;
        relation.updated_at = Utc::now();

        if relation.weight <= 0.0 {
            self.delete_row(&key)?;
            self.delete_row(&Self::reverse_relation_key(owner, src, dst, predicate))?;
        } else {
            self.put_row(&key, &relation)?;
            self.put_row(
                &Self::reverse_relation_key(owner, src, dst, predicate),
                &relation,
            )?;
        }
        Ok(())
    }

    /// Adjacent entities with edge weights, both directions.
    pub fn neighbors(&self, owner: &OwnerId, entity: &Uuid) -> Result<Vec<(Uuid, f32)>> {
        let mut out = Vec::new();
        let outgoing: Vec<Relation> =
            self.scan_rows(&format!("rel:{}:{}:", owner.partition_key(), entity))?;
        for rel in outgoing {
            out.push((rel.target, rel.weight));
        }
        let incoming: Vec<Relation> =
            self.scan_rows(&format!("radj:{}:{}:", owner.partition_key(), entity))?;
        for rel in incoming {
            out.push((rel.source, rel.weight));
        }
        Ok(out)
    }

    /// Total adjacent edge weight of an entity (graph-boost normalizer).
    pub fn total_weight(&self, owner: &OwnerId, entity: &Uuid) -> Result<f32> {
        Ok(self.neighbors(owner, entity)?.iter().map(|(_, w)| w).sum())
    }

    pub fn relations_for_owner(&self, owner: &OwnerId) -> Result<Vec<Relation>> {
        self.scan_rows(&format!("rel:{}:", owner.partition_key()))
    }

    /// Entities reachable from a start set within `depth` hops. Cycles are
    /// handled with a visited set.
    pub fn neighborhood(
        &self,
        owner: &OwnerId,
        start: &[Uuid],
        depth: usize,
    ) -> Result<HashSet<Uuid>> {
        let mut visited: HashSet<Uuid> = start.iter().copied().collect();
        let mut frontier: Vec<Uuid> = start.to_vec();

        for _ in 0..depth.min(2) {
            let mut next = Vec::new();
            for entity in &frontier {
                for (neighbor, _) in self.neighbors(owner, entity)? {
                    if visited.insert(neighbor) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(visited)
    }

    // =========================================================================
    // Memory <-> entity links
    // =========================================================================

    fn link_key(owner: &OwnerId, memory: &Uuid, entity: &Uuid) -> String {
        format!("link:{}:{}:{}", owner.partition_key(), memory, entity)
    }

    fn rlink_key(owner: &OwnerId, entity: &Uuid, memory: &Uuid) -> String {
        format!("rlink:{}:{}:{}", owner.partition_key(), entity, memory)
    }

    pub fn link_memory(&self, owner: &OwnerId, memory: &Uuid, entity: &Uuid) -> Result<()> {
        self.db.put_opt(
            Self::link_key(owner, memory, entity).as_bytes(),
            b"1",
            &sync_writes(),
        )?;
        self.db.put_opt(
            Self::rlink_key(owner, entity, memory).as_bytes(),
            b"1",
            &sync_writes(),
        )?;
        Ok(())
    }

    pub fn unlink_memory(&self, owner: &OwnerId, memory: &Uuid, entity: &Uuid) -> Result<()> {
        self.delete_row(&Self::link_key(owner, memory, entity))?;
        self.delete_row(&Self::rlink_key(owner, entity, memory))?;
        Ok(())
    }

    pub fn links_for_memory(&self, owner: &OwnerId, memory: &Uuid) -> Result<Vec<Uuid>> {
        let prefix = format!("link:{}:{}:", owner.partition_key(), memory);
        let mut entities = Vec::new();
        for key in self.scan_keys(&prefix)? {
            if let Some(id_str) = key.strip_prefix(&prefix) {
                if let Ok(id) = Uuid::parse_str(id_str) {
                    entities.push(id);
                }
            }
        }
        Ok(entities)
    }

    pub fn memories_for_entity(&self, owner: &OwnerId, entity: &Uuid) -> Result<Vec<Uuid>> {
        let prefix = format!("rlink:{}:{}:", owner.partition_key(), entity);
        let mut memories = Vec::new();
        for key in self.scan_keys(&prefix)? {
            if let Some(id_str) = key.strip_prefix(&prefix) {
                if let Ok(id) = Uuid::parse_str(id_str) {
                    memories.push(id);
                }
            }
        }
        Ok(memories)
    }

    /// Replace a memory's link set, returning the previous set so a saga
    /// compensation can restore it.
    pub fn replace_links(
        &self,
        owner: &OwnerId,
        memory: &Uuid,
        entities: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let old = self.links_for_memory(owner, memory)?;
        for entity in &old {
            self.unlink_memory(owner, memory, entity)?;
        }
        for entity in entities {
            self.link_memory(owner, memory, entity)?;
        }
        Ok(old)
    }

    /// All memory links of one owner, as (memory, entity) pairs.
    pub fn all_links(&self, owner: &OwnerId) -> Result<Vec<(Uuid, Uuid)>> {
        let prefix = format!("link:{}:", owner.partition_key());
        let mut links = Vec::new();
        for key in self.scan_keys(&prefix)? {
            let rest = &key[prefix.len()..];
            if let Some((mem_str, ent_str)) = rest.split_once(':') {
                if let (Ok(mem), Ok(ent)) = (Uuid::parse_str(mem_str), Uuid::parse_str(ent_str)) {
                    links.push((mem, ent));
                }
            }
        }
        Ok(links)
    }

    // =========================================================================
    // Communities
    // =========================================================================

    fn community_key(owner: &OwnerId, id: u32) -> String {
        format!("comm:{}:{:05}", owner.partition_key(), id)
    }

    pub fn put_community(&self, owner: &OwnerId, community: &Community) -> Result<()> {
        self.put_row(&Self::community_key(owner, community.id), community)
    }

    pub fn communities(&self, owner: &OwnerId) -> Result<Vec<Community>> {
        self.scan_rows(&format!("comm:{}:", owner.partition_key()))
    }

    /// Recompute communities by label propagation over the relation graph
    /// and refresh degree centrality. Returns the new communities; their
    /// summaries are empty and are filled in by the community job.
    pub fn recompute_communities(&self, owner: &OwnerId) -> Result<Vec<Community>> {
        let entities = self.entities_for_owner(owner)?;
        let relations = self.relations_for_owner(owner)?;

        let mut graph: UnGraph<Uuid, f32> = UnGraph::new_undirected();
        let mut node_of = HashMap::new();
        for entity in &entities {
            node_of.insert(entity.id, graph.add_node(entity.id));
        }
        for rel in &relations {
            if let (Some(&a), Some(&b)) = (node_of.get(&rel.source), node_of.get(&rel.target)) {
                graph.add_edge(a, b, rel.weight);
            }
        }

        // Label propagation: each node adopts the label with the highest
        // adjacent edge-weight sum; a few rounds are enough at this scale.
        let mut labels: HashMap<_, usize> = graph
            .node_indices()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        for _ in 0..8 {
            let mut changed = false;
            for node in graph.node_indices() {
                let mut tally: HashMap<usize, f32> = HashMap::new();
                for edge in graph.edges(node) {
                    let other = if edge.source() == node {
                        edge.target()
                    } else {
                        edge.source()
                    };
                    *tally.entry(labels[&other]).or_default() += *edge.weight();
                }
                if let Some((&best, _)) = tally
                    .iter()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                {
                    if labels[&node] != best {
                        labels.insert(node, best);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Group by label; only clusters of two or more form a community.
        let mut groups: HashMap<usize, Vec<Uuid>> = HashMap::new();
        for (node, label) in &labels {
            groups.entry(*label).or_default().push(graph[*node]);
        }

        // Drop stale community rows before writing the new generation
        for old in self.communities(owner)? {
            self.delete_row(&Self::community_key(owner, old.id))?;
        }

        let now = Utc::now();
        let mut communities = Vec::new();
        let mut next_id = 0u32;
        let mut community_of: HashMap<Uuid, u32> = HashMap::new();
        for (_, members) in groups {
            if members.len() < 2 {
                continue;
            }
            for member in &members {
                community_of.insert(*member, next_id);
            }
            let community = Community {
                id: next_id,
                entity_ids: members,
                summary: String::new(),
                updated_at: now,
            };
            self.put_community(owner, &community)?;
            communities.push(community);
            next_id += 1;
        }

        // Refresh community assignment + degree centrality on entity rows
        let max_degree = graph
            .node_indices()
            .map(|n| graph.edges(n).count())
            .max()
            .unwrap_or(0)
            .max(1);
        for entity in entities {
            let mut updated = entity.clone();
            updated.community = community_of.get(&entity.id).copied();
            if let Some(&node) = node_of.get(&entity.id) {
                updated.centrality = graph.edges(node).count() as f32 / max_degree as f32;
            }
            self.put_row(&Self::entity_key(owner, &updated.id), &updated)?;
        }

        Ok(communities)
    }

    pub fn entity_count(&self) -> Result<usize> {
        Ok(self.scan_keys("ent:")?.len())
    }

    pub fn flush(&self) -> Result<()> {
        use rocksdb::FlushOptions;
        let mut opts = FlushOptions::default();
        opts.set_wait(true);
        self.db
            .flush_opt(&opts)
            .map_err(|e| anyhow!("flush graph store: {e}"))
    }
}
