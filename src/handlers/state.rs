//! Application state: the injected handles every request-scoped context
//! works against. Stores, LLM clients, queue, reconciler and retriever are
//! long-lived and shared; nothing here is a module global.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::crypto::ContentCipher;
use crate::ingest::{IngestWorker, TaskQueue, TrivialFilters};
use crate::llm::{ChatModel, Embedder, FactExtractor, OpenAiChat, OpenAiEmbedder};
use crate::quota::QuotaService;
use crate::reconcile::{DriftSweeper, OwnerLocks, Reconciler};
use crate::retrieve::Retriever;
use crate::store::TriStore;

pub struct AppContext {
    pub config: ServerConfig,
    pub stores: TriStore,
    pub queue: Arc<TaskQueue>,
    pub worker: Arc<IngestWorker>,
    pub reconciler: Arc<Reconciler>,
    pub retriever: Arc<Retriever>,
    pub extractor: Arc<FactExtractor>,
    pub quota: Arc<QuotaService>,
    pub sweeper: Arc<DriftSweeper>,
    pub cipher: Option<ContentCipher>,
}

/// Application state type alias used by all handlers.
pub type AppState = Arc<AppContext>;

impl AppContext {
    /// Wire the full context from injected model handles. Tests pass fakes
    /// here; production uses [`AppContext::from_config`].
    pub fn new(
        config: ServerConfig,
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<AppState> {
        let cipher = match &config.content_key {
            Some(hex) => Some(ContentCipher::from_hex(hex).context("content-at-rest key")?),
            None => None,
        };

        let stores = TriStore::open(&config.data_dir, embedder.dimension())?;
        let extractor = Arc::new(FactExtractor::new(chat));
        let locks = Arc::new(OwnerLocks::default());

        let reconciler = Arc::new(Reconciler::new(
            stores.relational.clone(),
            stores.vector.clone(),
            stores.graph.clone(),
            extractor.clone(),
            embedder.clone(),
            config.thresholds,
            cipher.clone(),
            locks.clone(),
        ));

        let retriever = Arc::new(Retriever::new(
            stores.relational.clone(),
            stores.vector.clone(),
            stores.graph.clone(),
            extractor.clone(),
            embedder.clone(),
            config.weights,
            cipher.clone(),
        ));

        let sweeper = Arc::new(DriftSweeper::new(
            stores.relational.clone(),
            stores.vector.clone(),
            stores.graph.clone(),
            embedder.clone(),
            cipher.clone(),
            locks,
        ));

        let queue = Arc::new(TaskQueue::new(stores.relational.clone()));
        let worker = Arc::new(IngestWorker::new(
            stores.relational.clone(),
            extractor.clone(),
            reconciler.clone(),
            TrivialFilters::default(),
            std::time::Duration::from_secs(config.task_deadline_secs),
        ));

        let quota = Arc::new(QuotaService::new(stores.relational.clone()));

        Ok(Arc::new(Self {
            config,
            stores,
            queue,
            worker,
            reconciler,
            retriever,
            extractor,
            quota,
            sweeper,
            cipher,
        }))
    }

    /// Production wiring: OpenAI-compatible chat and embedding clients
    /// behind a shared rate-limit semaphore.
    pub fn from_config(config: ServerConfig) -> Result<AppState> {
        let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
        let chat: Arc<dyn ChatModel> =
            Arc::new(OpenAiChat::new(config.llm.clone(), semaphore.clone()));
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
            config.embed.clone(),
            config.embed_dim,
            semaphore,
        ));
        Self::new(config, chat, embedder)
    }

    /// Recover in-flight tasks and start the dispatcher + worker pool.
    pub fn start_workers(&self) -> Result<tokio::task::JoinHandle<()>> {
        self.queue.recover()?;
        Ok(self
            .queue
            .clone()
            .spawn_dispatcher(self.worker.clone(), self.config.workers))
    }

    /// One community maintenance pass over every owner partition: recompute
    /// clusters, then fill in their summaries (best-effort).
    pub async fn run_community_job(&self) -> Result<usize> {
        let mut rebuilt = 0;
        for owner in self.stores.relational.owner_partitions()? {
            let communities = self.stores.graph.recompute_communities(&owner)?;
            for mut community in communities {
                let names: Vec<String> = community
                    .entity_ids
                    .iter()
                    .filter_map(|id| self.stores.graph.entity(&owner, id).ok().flatten())
                    .map(|e| e.name)
                    .collect();
                match self.extractor.summarize_community(&names).await {
                    Ok(summary) => {
                        community.summary = summary;
                        self.stores.graph.put_community(&owner, &community)?;
                    }
                    Err(e) => {
                        tracing::debug!("Community summary unavailable: {}", e);
                    }
                }
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    /// Flush all stores; called during graceful shutdown.
    pub fn flush_stores(&self) -> Result<()> {
        self.stores.flush()
    }
}
