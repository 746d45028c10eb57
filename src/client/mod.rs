//! Client SDK (C1): a per-device durable outbox decoupling application
//! calls from the network, with at-least-once delivery to the ingest
//! endpoints.
//!
//! `add_memory` / `add_message` enqueue into an embedded store and return
//! immediately; a flush pass drains the queues under five triggers
//! (rounds, batch size, token budget, idle timeout, custom predicate) with
//! exponential-backoff retry and a dead-letter queue for items that exhaust
//! their retries. Nothing is silently dropped.

pub mod outbox;
pub mod tokens;
pub mod transport;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::types::Role;
pub use outbox::{DeadLetter, DeadPayload, Outbox, QueuedMemory, QueuedMessage, SegmentMeta};
pub use tokens::TokenCounter;
pub use transport::{HttpTransport, Registration, TaskAccepted, Transport, TransportError};

/// Retries before an item is eligible for the dead-letter queue. The item
/// moves on the first failure after the counter reaches this value.
pub const MAX_RETRY: u32 = 5;
/// Backoff clamp.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Dead letters older than this are swept.
const DEAD_LETTER_RETENTION_DAYS: i64 = 30;
/// Batch requests carry at most this many memories.
const BATCH_CHUNK: usize = 50;

/// Queue snapshot handed to custom trigger predicates and diagnostics.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub message_count: usize,
    pub rounds: u32,
    pub total_tokens: u64,
    pub oldest_message_age: Option<Duration>,
    pub conversation_id: String,
}

/// Custom trigger predicate over queue stats.
pub type TriggerFn = Arc<dyn Fn(&QueueStats) -> bool + Send + Sync>;

/// When a flush fires. Any satisfied trigger flushes.
#[derive(Clone, Default)]
pub struct FlushPolicy {
    /// Completed user->assistant rounds.
    pub rounds: Option<u32>,
    /// Queued item count (messages or memories).
    pub batch_size: Option<usize>,
    /// Token budget across queued messages.
    pub max_tokens: Option<u64>,
    /// Quiet time since the last enqueue.
    pub idle: Option<Duration>,
    /// Periodic flush for the auto-flush worker.
    pub interval: Option<Duration>,
    /// Injected predicate.
    pub custom: Option<TriggerFn>,
}

impl FlushPolicy {
    /// Flush after every item.
    pub fn realtime() -> Self {
        Self {
            batch_size: Some(1),
            ..Default::default()
        }
    }

    /// Flush on 50 queued items or every 5 seconds.
    pub fn batch() -> Self {
        Self {
            batch_size: Some(50),
            interval: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    /// Flush on a 30k token budget or 5 minutes of quiet.
    pub fn conversation() -> Self {
        Self {
            max_tokens: Some(30_000),
            idle: Some(Duration::from_secs(300)),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for FlushPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushPolicy")
            .field("rounds", &self.rounds)
            .field("batch_size", &self.batch_size)
            .field("max_tokens", &self.max_tokens)
            .field("idle", &self.idle)
            .field("interval", &self.interval)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub project_id: String,
    /// Outbox directory; defaults under the user's home.
    pub data_dir: PathBuf,
    pub policy: FlushPolicy,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            base_url: "https://t0ken.ai/api".to_string(),
            api_key: None,
            project_id: "default".to_string(),
            data_dir: PathBuf::from(home).join(".memoryx").join("outbox"),
            policy: FlushPolicy::conversation(),
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// What one flush pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was in progress; this call was a no-op.
    AlreadyInFlight,
    Done {
        delivered_memories: usize,
        delivered_segments: usize,
        dead_lettered: usize,
    },
}

struct ConversationState {
    segment_id: String,
    last_activity: Instant,
}

pub struct MemoryClient {
    config: ClientConfig,
    outbox: Outbox,
    transport: Arc<dyn Transport>,
    counter: TokenCounter,
    conversation: Mutex<ConversationState>,
    in_flight: AtomicBool,
    flush_wanted: tokio::sync::Notify,
}

impl MemoryClient {
    /// Open the client against a MemoryX server over HTTP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(
            config.base_url.clone(),
            config.api_key.clone(),
        ));
        Self::with_transport(config, transport)
    }

    /// Open with an injected transport (tests, custom wiring).
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let outbox = Outbox::open(&config.data_dir).context("open client outbox")?;

        // A saved key from a previous registration wins over none
        if config.api_key.is_none() {
            if let Some(saved) = outbox.get_config("api_key")? {
                transport.set_api_key(&saved);
            }
        }

        let segment_id = match outbox.get_config("conversation_id")? {
            Some(id) => id,
            None => {
                let id = new_segment_id();
                outbox.set_config("conversation_id", &id)?;
                id
            }
        };

        Ok(Self {
            config,
            outbox,
            transport,
            counter: TokenCounter::default(),
            conversation: Mutex::new(ConversationState {
                segment_id,
                last_activity: Instant::now(),
            }),
            in_flight: AtomicBool::new(false),
            flush_wanted: tokio::sync::Notify::new(),
        })
    }

    /// Register this machine and persist the issued identity.
    pub async fn auto_register(&self, agent_type: &str, agent_name: &str) -> Result<Registration> {
        let registration = self
            .transport
            .auto_register(
                &machine_fingerprint(),
                agent_type,
                agent_name,
                std::env::consts::OS,
                std::env::consts::ARCH,
            )
            .await
            .map_err(|e| anyhow::anyhow!("registration failed: {e}"))?;

        self.outbox.set_config("api_key", &registration.api_key)?;
        self.outbox.set_config("agent_id", &registration.agent_id)?;
        self.outbox
            .set_config("project_id", &registration.project_id)?;
        Ok(registration)
    }

    // =========================================================================
    // Enqueue operations
    // =========================================================================

    /// Queue one memory write. Returns the monotone local id. Wakes the
    /// auto-flush worker immediately when a trigger is already satisfied.
    pub fn add_memory(
        &self,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<u64> {
        let local_id = self
            .outbox
            .enqueue_memory(content, metadata.map(|m| m.to_string()))?;
        self.conversation.lock().last_activity = Instant::now();
        if self.should_flush()? {
            self.flush_wanted.notify_one();
        }
        Ok(local_id)
    }

    /// Append a message to the current conversation segment.
    pub fn add_message(&self, role: Role, content: &str) -> Result<u64> {
        let tokens = self.counter.count(content);
        let segment_id = {
            let mut state = self.conversation.lock();
            state.last_activity = Instant::now();
            state.segment_id.clone()
        };
        let local_id = self
            .outbox
            .enqueue_message(&segment_id, role, content, tokens)?;
        if self.should_flush()? {
            self.flush_wanted.notify_one();
        }
        Ok(local_id)
    }

    /// Seal the current segment (it stays queued) and start a new one.
    /// Returns the new segment id.
    pub fn start_new_conversation(&self) -> Result<String> {
        let id = new_segment_id();
        self.outbox.set_config("conversation_id", &id)?;
        let mut state = self.conversation.lock();
        state.segment_id = id.clone();
        state.last_activity = Instant::now();
        Ok(id)
    }

    /// Snapshot of the current conversation segment for diagnostics and
    /// custom trigger functions.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let segment_id = self.conversation.lock().segment_id.clone();
        let messages = self.outbox.segment_messages(&segment_id)?;

        let oldest_message_age = messages.first().map(|(_, m)| {
            let age = Utc::now().signed_duration_since(m.queued_at);
            Duration::from_millis(age.num_milliseconds().max(0) as u64)
        });

        Ok(QueueStats {
            message_count: messages.len(),
            rounds: count_rounds(messages.iter().map(|(_, m)| m.role)),
            total_tokens: messages.iter().map(|(_, m)| m.tokens as u64).sum(),
            oldest_message_age,
            conversation_id: segment_id,
        })
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self
            .outbox
            .dead_letters()?
            .into_iter()
            .map(|(_, l)| l)
            .collect())
    }

    // =========================================================================
    // Flush triggers
    // =========================================================================

    /// Whether any configured trigger currently fires.
    pub fn should_flush(&self) -> Result<bool> {
        let policy = &self.config.policy;
        let stats = self.queue_stats()?;
        let memory_count = self.outbox.memory_count()?;

        if let Some(threshold) = policy.batch_size {
            if stats.message_count >= threshold || memory_count >= threshold {
                return Ok(true);
            }
        }
        if let Some(threshold) = policy.rounds {
            if stats.rounds >= threshold {
                return Ok(true);
            }
        }
        if let Some(budget) = policy.max_tokens {
            if stats.total_tokens >= budget {
                return Ok(true);
            }
        }
        if let Some(idle) = policy.idle {
            let quiet = self.conversation.lock().last_activity.elapsed();
            if quiet >= idle && (stats.message_count > 0 || memory_count > 0) {
                return Ok(true);
            }
        }
        if let Some(custom) = &policy.custom {
            if custom(&stats) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the auto-flush worker: wakes on enqueue notifications, checks
    /// triggers once a second and honors the interval preset.
    pub fn start_auto_flush(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self;
        tokio::spawn(async move {
            let mut last_interval_flush = Instant::now();
            loop {
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    client.flush_wanted.notified(),
                )
                .await;

                let interval_due = client
                    .config
                    .policy
                    .interval
                    .is_some_and(|i| last_interval_flush.elapsed() >= i);

                let triggered = client.should_flush().unwrap_or(false);
                if triggered || interval_due {
                    if let Err(e) = client.flush().await {
                        tracing::warn!("Auto-flush failed: {}", e);
                    }
                    last_interval_flush = Instant::now();
                }
            }
        })
    }

    // =========================================================================
    // Flush pass
    // =========================================================================

    /// One flush pass over both queues. Idempotent while in progress: a
    /// concurrent call returns immediately. Never blocks enqueues.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(FlushOutcome::AlreadyInFlight);
        }
        let result = self.flush_inner().await;
        self.in_flight.store(false, Ordering::Release);
        result
    }

    async fn flush_inner(&self) -> Result<FlushOutcome> {
        let mut delivered_memories = 0;
        let mut delivered_segments = 0;
        let mut dead_lettered = 0;

        // Seal the current segment first so messages enqueued during the
        // flush land in a fresh segment id (segment ids are idempotency
        // keys server-side; re-sending one with more messages would NOOP)
        {
            let current = self.conversation.lock().segment_id.clone();
            if !self.outbox.segment_messages(&current)?.is_empty() {
                self.start_new_conversation()?;
            }
        }

        // Memory queue: due items, batched
        let now = Utc::now();
        let due: Vec<(String, QueuedMemory)> = self
            .outbox
            .memory_items()?
            .into_iter()
            .filter(|(_, m)| m.next_attempt_at.is_none_or(|at| at <= now))
            .collect();

        for chunk in due.chunks(BATCH_CHUNK) {
            let items: Vec<QueuedMemory> = chunk.iter().map(|(_, m)| m.clone()).collect();
            let result = if items.len() == 1 {
                self.transport
                    .send_memory(&items[0], &self.config.project_id)
                    .await
            } else {
                self.transport
                    .send_batch(&items, &self.config.project_id)
                    .await
            };

            match result {
                Ok(_) => {
                    for (key, _) in chunk {
                        self.outbox.remove_key(key)?;
                    }
                    delivered_memories += chunk.len();
                }
                Err(e) => {
                    tracing::debug!("Memory flush attempt failed: {}", e);
                    for (key, item) in chunk {
                        dead_lettered += self.record_memory_failure(key, item, &e)?;
                    }
                }
            }
        }

        // Conversation queue: one request per segment, in segment order
        for segment_id in self.outbox.segments()? {
            let meta = self.outbox.segment_meta(&segment_id)?;
            if meta.next_attempt_at.is_some_and(|at| at > Utc::now()) {
                continue;
            }
            let messages: Vec<QueuedMessage> = self
                .outbox
                .segment_messages(&segment_id)?
                .into_iter()
                .map(|(_, m)| m)
                .collect();
            if messages.is_empty() {
                continue;
            }

            match self
                .transport
                .send_conversation(&segment_id, &messages)
                .await
            {
                Ok(_) => {
                    self.outbox.clear_segment(&segment_id)?;
                    delivered_segments += 1;
                }
                Err(e) => {
                    tracing::debug!("Segment {} flush attempt failed: {}", segment_id, e);
                    dead_lettered +=
                        self.record_segment_failure(&segment_id, meta, messages, &e)?;
                }
            }
        }

        self.outbox
            .sweep_dead_letters(chrono::Duration::days(DEAD_LETTER_RETENTION_DAYS))?;

        Ok(FlushOutcome::Done {
            delivered_memories,
            delivered_segments,
            dead_lettered,
        })
    }

    /// Bump an item's retry state; dead-letter it on the first failure
    /// after the counter reached MAX_RETRY. Returns 1 when dead-lettered.
    fn record_memory_failure(
        &self,
        key: &str,
        item: &QueuedMemory,
        error: &TransportError,
    ) -> Result<usize> {
        let mut item = item.clone();
        item.retry_count += 1;
        item.last_attempt_at = Some(Utc::now());

        if item.retry_count > MAX_RETRY {
            self.outbox.push_dead_letter(&DeadLetter {
                first_queued_at: item.first_queued_at,
                payload: DeadPayload::Memory(item),
                error: error.to_string(),
                dead_at: Utc::now(),
            })?;
            self.outbox.remove_key(key)?;
            tracing::warn!("Memory item dead-lettered after {} retries", MAX_RETRY);
            return Ok(1);
        }

        let delay = backoff_delay(self.config.backoff_base, item.retry_count);
        item.next_attempt_at = Some(Utc::now() + chrono::Duration::from_std(delay)?);
        self.outbox.update_memory_item(key, &item)?;
        Ok(0)
    }

    fn record_segment_failure(
        &self,
        segment_id: &str,
        mut meta: SegmentMeta,
        messages: Vec<QueuedMessage>,
        error: &TransportError,
    ) -> Result<usize> {
        meta.retry_count += 1;
        meta.last_attempt_at = Some(Utc::now());
        meta.last_error = Some(error.to_string());

        if meta.retry_count > MAX_RETRY {
            let first_queued_at = messages
                .first()
                .map(|m| m.queued_at)
                .unwrap_or_else(Utc::now);
            self.outbox.push_dead_letter(&DeadLetter {
                payload: DeadPayload::Segment {
                    segment_id: segment_id.to_string(),
                    messages,
                },
                error: error.to_string(),
                first_queued_at,
                dead_at: Utc::now(),
            })?;
            self.outbox.clear_segment(segment_id)?;
            tracing::warn!(
                "Segment {} dead-lettered after {} retries",
                segment_id,
                MAX_RETRY
            );
            return Ok(1);
        }

        let delay = backoff_delay(self.config.backoff_base, meta.retry_count);
        meta.next_attempt_at = Some(Utc::now() + chrono::Duration::from_std(delay)?);
        self.outbox.put_segment_meta(segment_id, &meta)?;
        Ok(0)
    }
}

/// Exponential backoff `base * 2^retry`, clamped to 60 s, with +/-20%
/// jitter so a fleet of clients does not retry in lockstep.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry.min(16)));
    let clamped = exp.min(BACKOFF_CAP);
    let jitter = rand::rng().random_range(0.8..=1.2);
    clamped.mul_f64(jitter)
}

/// Completed user->assistant pairs in insertion order. Repeated same-role
/// messages do not advance the count.
pub fn count_rounds(roles: impl Iterator<Item = Role>) -> u32 {
    let mut rounds = 0;
    let mut pending_user = false;
    for role in roles {
        match role {
            Role::User => pending_user = true,
            Role::Assistant => {
                if pending_user {
                    rounds += 1;
                    pending_user = false;
                }
            }
        }
    }
    rounds
}

fn new_segment_id() -> String {
    format!("conv-{}", Uuid::new_v4())
}

/// SHA-256 prefix (32 hex chars) over a canonical join of host, platform,
/// arch, first CPU model string and total memory bytes.
pub fn machine_fingerprint() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(read_etc_hostname)
        .unwrap_or_else(|| "unknown-host".to_string());
    let cpu = first_cpu_model().unwrap_or_else(|| "unknown-cpu".to_string());
    let memory = total_memory_bytes().unwrap_or(0);

    let raw = format!(
        "{host}|{}|{}|{cpu}|{memory}",
        std::env::consts::OS,
        std::env::consts::ARCH,
    );
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn read_etc_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_cpu_model() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split(':').nth(1))
        .map(|s| s.trim().to_string())
}

fn total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let kb: u64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some(kb * 1024)
}
