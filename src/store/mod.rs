//! Tri-store layer: relational rows (authoritative), vector similarity
//! index and entity graph.
//!
//! The only cross-store guarantee is the per-memory saga in the reconciler.
//! There is no global transaction; readers tolerate the brief window where a
//! relational row exists without its vector or links, and the drift sweep
//! re-converges the follower stores to relational truth.

pub mod graph;
pub mod relational;
pub mod vector;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

pub use graph::GraphStore;
pub use relational::RelationalStore;
pub use vector::VectorIndex;

/// The three coupled stores, opened under one data directory.
pub struct TriStore {
    pub relational: Arc<RelationalStore>,
    pub vector: Arc<VectorIndex>,
    pub graph: Arc<GraphStore>,
}

impl TriStore {
    pub fn open(data_dir: &Path, embed_dim: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            relational: Arc::new(RelationalStore::open(&data_dir.join("relational"))?),
            vector: Arc::new(VectorIndex::open(&data_dir.join("vector"), embed_dim)?),
            graph: Arc::new(GraphStore::open(&data_dir.join("graph"))?),
        })
    }

    /// Flush all stores; called on graceful shutdown.
    pub fn flush(&self) -> Result<()> {
        self.relational.flush()?;
        self.vector.flush()?;
        self.graph.flush()?;
        Ok(())
    }
}
