//! Conversation aggregator and ingestion worker.
//!
//! Turns a task payload (single memory, batch, or conversation segment)
//! into candidate facts and hands them to the reconciler. Conversations
//! are summarized first; transcripts are never persisted past task
//! completion. LLM failures retry with exponential backoff up to three
//! attempts before the task fails.

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{FactExtractor, LlmError, RawFact};
use crate::metrics;
use crate::reconcile::{Deadline, ReconcileError, Reconciler};
use crate::store::relational::RelationalStore;
use crate::types::{
    CandidateFact, IngestReport, OwnerId, TaskPayload, TaskRecord, TaskStatus,
};

/// LLM attempts per task before permanent failure.
const LLM_MAX_ATTEMPTS: u32 = 3;
/// Base retry delay; doubles per attempt.
const LLM_RETRY_BASE: Duration = Duration::from_millis(500);

/// Candidate-fact filters: too short, trivial content, no entities.
pub struct TrivialFilters {
    patterns: Vec<Regex>,
}

impl Default for TrivialFilters {
    fn default() -> Self {
        // Greetings, acknowledgements and pure punctuation carry no facts
        let patterns = [
            r"(?i)^(hi|hello|hey|yo|good (morning|afternoon|evening|night))[\s.!?,]*$",
            r"(?i)^(thanks|thank you|ok|okay|yes|no|sure|got it|bye|goodbye)[\s.!?,]*$",
            r"^[\p{P}\s]*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static filter pattern"))
        .collect();
        Self { patterns }
    }
}

impl TrivialFilters {
    pub fn with_patterns(extra: &[&str]) -> Self {
        let mut filters = Self::default();
        for pattern in extra {
            if let Ok(regex) = Regex::new(pattern) {
                filters.patterns.push(regex);
            } else {
                tracing::warn!("Ignoring invalid trivial-content pattern: {}", pattern);
            }
        }
        filters
    }

    pub fn is_trivial(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() < 2 {
            return true;
        }
        self.patterns.iter().any(|p| p.is_match(trimmed))
    }
}

/// Outcome of one worker run, before it is folded into the task row.
enum RunError {
    Failure(String),
    Timeout(String),
}

/// Consumes tasks from the queue: summarize, extract, filter, reconcile.
pub struct IngestWorker {
    relational: Arc<RelationalStore>,
    extractor: Arc<FactExtractor>,
    reconciler: Arc<Reconciler>,
    filters: TrivialFilters,
    task_deadline: Duration,
}

impl IngestWorker {
    pub fn new(
        relational: Arc<RelationalStore>,
        extractor: Arc<FactExtractor>,
        reconciler: Arc<Reconciler>,
        filters: TrivialFilters,
        task_deadline: Duration,
    ) -> Self {
        Self {
            relational,
            extractor,
            reconciler,
            filters,
            task_deadline,
        }
    }

    /// Process one task end to end and persist its terminal state.
    pub async fn process_task(&self, mut task: TaskRecord) {
        let start = std::time::Instant::now();
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.updated_at = chrono::Utc::now();
        if let Err(e) = self.relational.put_task(&task) {
            tracing::error!("Failed to mark task {} running: {}", task.id, e);
            return;
        }

        let deadline = Deadline::after(self.task_deadline);
        let outcome = self.run(&task, deadline).await;

        match outcome {
            Ok(report) => {
                task.status = if !report.compensated.is_empty() {
                    TaskStatus::Partial
                } else {
                    TaskStatus::Success
                };
                task.error = None;
                task.result = Some(report);
            }
            Err(RunError::Timeout(msg)) => {
                task.status = TaskStatus::Failure;
                task.error = Some(format!("TIMEOUT: {msg}"));
            }
            Err(RunError::Failure(msg)) => {
                task.status = TaskStatus::Failure;
                task.error = Some(msg);
            }
        }
        task.updated_at = chrono::Utc::now();

        metrics::INGEST_TASKS_TOTAL
            .with_label_values(&[task.status.as_str()])
            .inc();
        metrics::INGEST_TASK_DURATION.observe(start.elapsed().as_secs_f64());

        if let Err(e) = self.relational.put_task(&task) {
            tracing::error!("Failed to persist task {} result: {}", task.id, e);
        }
        tracing::info!(
            "Task {} finished: {} (attempt {})",
            task.id,
            task.status.as_str(),
            task.attempts
        );
    }

    async fn run(&self, task: &TaskRecord, deadline: Deadline) -> Result<IngestReport, RunError> {
        let owner = &task.owner;
        match &task.payload {
            TaskPayload::Memory { content, .. } => {
                self.ingest_text(owner, content, &task.id.to_string(), deadline)
                    .await
            }
            TaskPayload::Batch { contents } => {
                let mut report = IngestReport::default();
                for content in contents {
                    let partial = self
                        .ingest_text(owner, content, &task.id.to_string(), deadline)
                        .await?;
                    report.merge(partial);
                }
                Ok(report)
            }
            TaskPayload::Conversation { segment } => {
                // Summarize-and-discard: only the summary flows onward
                let transcript = segment.transcript();
                let summary = self
                    .with_llm_retry(deadline, || self.extractor.summarize(&transcript))
                    .await?;
                self.ingest_text(owner, &summary, &segment.id, deadline)
                    .await
            }
        }
    }

    /// Extract facts from text, filter, enrich with graph extraction and
    /// reconcile. Partial extraction always commits the surviving facts;
    /// the rejected count lands in the task result.
    async fn ingest_text(
        &self,
        owner: &OwnerId,
        text: &str,
        source_id: &str,
        deadline: Deadline,
    ) -> Result<IngestReport, RunError> {
        let facts = self
            .with_llm_retry(deadline, || self.extractor.extract_facts(text))
            .await?;

        let mut rejected = 0u32;
        let mut candidates = Vec::new();
        for fact in facts {
            if self.filters.is_trivial(&fact.text) {
                rejected += 1;
                continue;
            }
            match self.build_candidate(owner, fact, source_id, deadline).await? {
                Some(candidate) => candidates.push(candidate),
                None => rejected += 1,
            }
        }

        let mut report = match self
            .reconciler
            .reconcile_batch(owner, candidates, deadline)
            .await
        {
            Ok(report) => report,
            Err(ReconcileError::Timeout(what)) => return Err(RunError::Timeout(what)),
            Err(ReconcileError::Relational(e)) => {
                return Err(RunError::Failure(format!("relational write failed: {e}")))
            }
            Err(ReconcileError::Llm(e)) if e.is_transient() => {
                // One more round for the whole batch; at-least-once is safe
                // because committed facts reconcile to NOOP on the retry
                tracing::warn!("Reconciliation hit transient LLM failure, retrying: {}", e);
                tokio::time::sleep(LLM_RETRY_BASE).await;
                deadline
                    .check("llm retry")
                    .map_err(|_| RunError::Timeout("llm retry".to_string()))?;
                let candidates = self
                    .rebuild_candidates(owner, text, source_id, deadline)
                    .await?;
                self.reconciler
                    .reconcile_batch(owner, candidates, deadline)
                    .await
                    .map_err(|e| RunError::Failure(e.to_string()))?
            }
            Err(ReconcileError::Llm(e)) => {
                return Err(RunError::Failure(format!("LLM_FAILURE: {e}")))
            }
        };

        report.rejected += rejected;
        Ok(report)
    }

    /// Graph-extract one fact and build the candidate. Returns `None` when
    /// the entity list stays empty (facts with no nouns are rejected).
    async fn build_candidate(
        &self,
        owner: &OwnerId,
        fact: RawFact,
        source_id: &str,
        deadline: Deadline,
    ) -> Result<Option<CandidateFact>, RunError> {
        let graph = self
            .with_llm_retry(deadline, || {
                self.extractor.extract_graph(&fact.text, &owner.user_id)
            })
            .await?;

        let mut entities = fact.entities.clone();
        for (name, _) in &graph.entities {
            if !entities.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                entities.push(name.clone());
            }
        }
        if entities.is_empty() {
            return Ok(None);
        }

        Ok(Some(CandidateFact {
            text: fact.text,
            category: fact.category,
            confidence: fact.confidence,
            source_id: source_id.to_string(),
            entities,
            entity_types: graph
                .entities
                .into_iter()
                .map(|(name, label)| (name, label.as_str().to_string()))
                .collect(),
            relations: graph.relations,
        }))
    }

    async fn rebuild_candidates(
        &self,
        owner: &OwnerId,
        text: &str,
        source_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<CandidateFact>, RunError> {
        let facts = self
            .with_llm_retry(deadline, || self.extractor.extract_facts(text))
            .await?;
        let mut candidates = Vec::new();
        for fact in facts {
            if self.filters.is_trivial(&fact.text) {
                continue;
            }
            if let Some(candidate) = self.build_candidate(owner, fact, source_id, deadline).await? {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    /// Run an LLM call with exponential backoff on transient failures.
    async fn with_llm_retry<T, F, Fut>(&self, deadline: Deadline, call: F) -> Result<T, RunError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let mut delay = LLM_RETRY_BASE;
        for attempt in 1..=LLM_MAX_ATTEMPTS {
            deadline
                .check("llm call")
                .map_err(|_| RunError::Timeout("llm call".to_string()))?;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < LLM_MAX_ATTEMPTS => {
                    tracing::warn!("LLM attempt {}/{} failed: {}", attempt, LLM_MAX_ATTEMPTS, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(RunError::Failure(format!("LLM_FAILURE: {e}"))),
            }
        }
        unreachable!("retry loop always returns")
    }
}
