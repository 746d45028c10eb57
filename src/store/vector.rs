//! Vector similarity index, keyed by memory id.
//!
//! Each entry carries an owner/category payload so kNN can be filtered to
//! one owner partition (and optionally one category) before scoring. The
//! forward map lives in memory; RocksDB persists it across restarts.
//! Similarity metric is cosine; dimensionality is a deploy-time constant.

use anyhow::{anyhow, Context, Result};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::similarity::cosine_similarity;
use crate::types::{Category, OwnerId};
use crate::validation::validate_embedding;

/// Filter payload stored with each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub owner: OwnerId,
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    id: Uuid,
    vector: Vec<f32>,
    payload: VectorPayload,
}

/// A scored kNN hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: Uuid,
    pub score: f32,
    pub category: Category,
}

pub struct VectorIndex {
    db: Arc<DB>,
    dim: usize,
    entries: RwLock<HashMap<Uuid, StoredVector>>,
}

impl VectorIndex {
    pub fn open(path: &Path, dim: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = Arc::new(DB::open(&opts, path)?);

        // Warm the forward map from disk
        let mut entries = HashMap::new();
        let iter = db.iterator(IteratorMode::Start);
        for item in iter {
            let (_, value) = item?;
            match bincode::deserialize::<StoredVector>(&value) {
                Ok(entry) => {
                    entries.insert(entry.id, entry);
                }
                Err(e) => tracing::warn!("Skipping undecodable vector entry: {}", e),
            }
        }
        tracing::debug!("Vector index loaded: {} entries (dim {})", entries.len(), dim);

        Ok(Self {
            db,
            dim,
            entries: RwLock::new(entries),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert or replace the vector for a memory id.
    pub fn upsert(&self, id: Uuid, vector: Vec<f32>, payload: VectorPayload) -> Result<()> {
        validate_embedding(&vector, self.dim)?;

        let entry = StoredVector {
            id,
            vector,
            payload,
        };
        let value = bincode::serialize(&entry).context("serialize vector entry")?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_opt(id.as_bytes(), value, &write_opts)
            .context("persist vector entry")?;

        self.entries.write().insert(id, entry);
        Ok(())
    }

    /// Delete by id, returning the removed entry so a saga compensation can
    /// restore it.
    pub fn delete(&self, id: &Uuid) -> Result<Option<(Vec<f32>, VectorPayload)>> {
        let removed = self.entries.write().remove(id);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .delete_opt(id.as_bytes(), &write_opts)
            .context("delete vector entry")?;
        Ok(removed.map(|e| (e.vector, e.payload)))
    }

    pub fn get(&self, id: &Uuid) -> Option<(Vec<f32>, VectorPayload)> {
        self.entries
            .read()
            .get(id)
            .map(|e| (e.vector.clone(), e.payload.clone()))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Filtered kNN: cosine similarity over one owner partition, optionally
    /// narrowed to a category. Returns up to k hits, best first.
    pub fn search(
        &self,
        owner: &OwnerId,
        category: Option<Category>,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        validate_embedding(query, self.dim).map_err(|e| anyhow!("query vector: {e}"))?;

        let entries = self.entries.read();
        let mut hits: Vec<(OrderedFloat<f32>, Uuid, Category)> = entries
            .values()
            .filter(|e| &e.payload.owner == owner)
            .filter(|e| category.is_none_or(|c| e.payload.category == c))
            .map(|e| {
                (
                    OrderedFloat(cosine_similarity(query, &e.vector)),
                    e.id,
                    e.payload.category,
                )
            })
            .collect();

        hits.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(hits
            .into_iter()
            .take(k)
            .map(|(score, id, category)| VectorHit {
                id,
                score: score.0,
                category,
            })
            .collect())
    }

    /// All vector ids of one owner partition (drift sweep input).
    pub fn ids_for_owner(&self, owner: &OwnerId) -> Vec<Uuid> {
        self.entries
            .read()
            .values()
            .filter(|e| &e.payload.owner == owner)
            .map(|e| e.id)
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        use rocksdb::FlushOptions;
        let mut opts = FlushOptions::default();
        opts.set_wait(true);
        self.db
            .flush_opt(&opts)
            .map_err(|e| anyhow!("flush vector index: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(owner: &OwnerId, category: Category) -> VectorPayload {
        VectorPayload {
            owner: owner.clone(),
            category,
        }
    }

    #[test]
    fn upsert_search_delete() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(dir.path(), 3).unwrap();
        let owner = OwnerId::new("u1", "default");

        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        index
            .upsert(id_a, vec![1.0, 0.0, 0.0], payload(&owner, Category::Fact))
            .unwrap();
        index
            .upsert(id_b, vec![0.0, 1.0, 0.0], payload(&owner, Category::Preference))
            .unwrap();

        let hits = index.search(&owner, None, &[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, id_a);
        assert!(hits[0].score > 0.99);

        // Category filter narrows the candidate set
        let hits = index
            .search(&owner, Some(Category::Preference), &[1.0, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id_b);

        let removed = index.delete(&id_a).unwrap();
        assert!(removed.is_some());
        assert!(!index.contains(&id_a));
    }

    #[test]
    fn owner_partitions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(dir.path(), 2).unwrap();
        let alice = OwnerId::new("alice", "default");
        let bob = OwnerId::new("bob", "default");

        index
            .upsert(Uuid::new_v4(), vec![1.0, 0.0], payload(&alice, Category::Fact))
            .unwrap();
        index
            .upsert(Uuid::new_v4(), vec![1.0, 0.0], payload(&bob, Category::Fact))
            .unwrap();

        let hits = index.search(&alice, None, &[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(index.ids_for_owner(&bob).len(), 1);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let owner = OwnerId::new("u1", "default");
        let id = Uuid::new_v4();

        {
            let index = VectorIndex::open(dir.path(), 2).unwrap();
            index
                .upsert(id, vec![0.5, 0.5], payload(&owner, Category::Fact))
                .unwrap();
        }

        let index = VectorIndex::open(dir.path(), 2).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains(&id));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(dir.path(), 3).unwrap();
        let owner = OwnerId::new("u1", "default");
        assert!(index
            .upsert(Uuid::new_v4(), vec![1.0, 0.0], payload(&owner, Category::Fact))
            .is_err());
        assert!(index.search(&owner, None, &[1.0], 5).is_err());
    }
}
