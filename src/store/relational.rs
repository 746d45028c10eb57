//! Authoritative relational store over RocksDB.
//!
//! Holds the rows every other store is reconciled against: memories, API
//! keys, registered agents, ingestion tasks with their durable queue,
//! idempotency keys and quota counters. All writes sync the WAL so rows
//! survive a crash before memtable flush.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::quota::QuotaRecord;
use crate::types::{MemoryId, MemoryRecord, OwnerId, TaskRecord, TaskStatus};

/// API key row; only the SHA-256 hash of the key is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub user_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Auto-registered agent row, keyed by machine fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub fingerprint: String,
    pub agent_type: String,
    pub agent_name: String,
    pub platform: String,
    pub platform_version: String,
    pub user_id: String,
    pub project_id: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Conversation-segment dedup key (24-hour window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// How long a segment id deduplicates re-submissions.
pub const IDEMPOTENCY_WINDOW_HOURS: i64 = 24;

pub struct RelationalStore {
    db: Arc<DB>,
    seq_lock: Mutex<()>,
}

fn sync_writes() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl RelationalStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_max_write_buffer_number(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_background_jobs(4);
        opts.set_level_compaction_dynamic_level_bytes(true);

        let db = Arc::new(DB::open(&opts, path)?);
        Ok(Self {
            db,
            seq_lock: Mutex::new(()),
        })
    }

    fn put_row<T: Serialize>(&self, key: &str, row: &T) -> Result<()> {
        let value =
            bincode::serialize(row).with_context(|| format!("serialize row for key {key}"))?;
        self.db
            .put_opt(key.as_bytes(), value, &sync_writes())
            .with_context(|| format!("put row {key}"))?;
        Ok(())
    }

    fn get_row<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(value) => {
                let row = bincode::deserialize(&value)
                    .with_context(|| format!("deserialize row {key} ({} bytes)", value.len()))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn delete_row(&self, key: &str) -> Result<()> {
        self.db
            .delete_opt(key.as_bytes(), &sync_writes())
            .with_context(|| format!("delete row {key}"))?;
        Ok(())
    }

    /// Iterate rows under a key prefix.
    fn scan_prefix<T: for<'de> Deserialize<'de>>(&self, prefix: &str) -> Result<Vec<T>> {
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
                Err(e) => {
                    tracing::warn!("Skipping undecodable row ({} bytes): {}", value.len(), e);
                }
            }
        }
        Ok(rows)
    }

    // =========================================================================
    // Memories
    // =========================================================================

    fn memory_key(owner: &OwnerId, id: &MemoryId) -> String {
        format!("mem:{}:{}", owner.partition_key(), id.0)
    }

    /// Insert-or-update one memory row. Atomic within the row.
    pub fn put_memory(&self, record: &MemoryRecord) -> Result<()> {
        self.put_row(&Self::memory_key(&record.owner, &record.id), record)
    }

    pub fn get_memory(&self, owner: &OwnerId, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.get_row(&Self::memory_key(owner, id))
    }

    /// Hard row removal; compensation path only. Normal deletes tombstone.
    pub fn remove_memory(&self, owner: &OwnerId, id: &MemoryId) -> Result<()> {
        self.delete_row(&Self::memory_key(owner, id))
    }

    /// All rows of one owner, tombstoned included (drift sweep input).
    pub fn iter_memories(&self, owner: &OwnerId) -> Result<Vec<MemoryRecord>> {
        self.scan_prefix(&format!("mem:{}:", owner.partition_key()))
    }

    /// Live rows, newest first, with pagination. Returns (page, total).
    pub fn list_memories(
        &self,
        owner: &OwnerId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MemoryRecord>, usize)> {
        let mut rows: Vec<MemoryRecord> = self
            .iter_memories(owner)?
            .into_iter()
            .filter(|m| !m.tombstoned)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = rows.len();
        let page = rows.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    pub fn count_live_memories(&self, owner: &OwnerId) -> Result<u64> {
        Ok(self
            .iter_memories(owner)?
            .iter()
            .filter(|m| !m.tombstoned)
            .count() as u64)
    }

    /// Count live rows across every project of one user (memory cap).
    pub fn count_live_memories_for_user(&self, user_id: &str) -> Result<u64> {
        let prefix = format!("mem:{user_id}/");
        let rows: Vec<MemoryRecord> = self.scan_prefix(&prefix)?;
        Ok(rows.iter().filter(|m| !m.tombstoned).count() as u64)
    }

    /// Locate a memory by id across every project partition of one user
    /// (the delete endpoint addresses memories by id alone).
    pub fn find_memory_for_user(
        &self,
        user_id: &str,
        id: &MemoryId,
    ) -> Result<Option<MemoryRecord>> {
        let rows: Vec<MemoryRecord> = self.scan_prefix(&format!("mem:{user_id}/"))?;
        Ok(rows.into_iter().find(|m| m.id == *id))
    }

    /// Distinct owner partitions that have at least one memory row.
    pub fn owner_partitions(&self) -> Result<Vec<OwnerId>> {
        let mut owners: Vec<OwnerId> = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(b"mem:", rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(b"mem:") {
                break;
            }
            let key_str = String::from_utf8_lossy(&key);
            let rest = &key_str["mem:".len()..];
            let Some((owner_key, _uuid)) = rest.rsplit_once(':') else {
                continue;
            };
            let Some((user, project)) = owner_key.split_once('/') else {
                continue;
            };
            let owner = OwnerId::new(user, project);
            if owners.last() != Some(&owner) && !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        Ok(owners)
    }

    // =========================================================================
    // Tasks and the durable dispatch queue
    // =========================================================================

    fn task_key(id: &Uuid) -> String {
        format!("task:{id}")
    }

    fn queue_key(seq: u64) -> String {
        format!("queue:{seq:020}")
    }

    /// Next task sequence number. Monotone across restarts.
    pub fn next_task_seq(&self) -> Result<u64> {
        let _guard = self.seq_lock.lock();
        let current = match self.db.get(b"meta:task_seq")? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt task sequence counter"))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };
        let next = current + 1;
        self.db
            .put_opt(b"meta:task_seq", next.to_be_bytes(), &sync_writes())?;
        Ok(next)
    }

    /// Persist a task row. Pending tasks keep a queue entry for dispatch;
    /// the entry is removed once the task reaches a terminal state.
    pub fn put_task(&self, task: &TaskRecord) -> Result<()> {
        self.put_row(&Self::task_key(&task.id), task)?;
        if task.status.is_terminal() {
            self.delete_row(&Self::queue_key(task.seq))?;
        } else {
            self.db.put_opt(
                Self::queue_key(task.seq).as_bytes(),
                task.id.to_string().as_bytes(),
                &sync_writes(),
            )?;
        }
        Ok(())
    }

    pub fn get_task(&self, id: &Uuid) -> Result<Option<TaskRecord>> {
        self.get_row(&Self::task_key(id))
    }

    /// Non-terminal tasks in arrival order. Used by the dispatcher and by
    /// startup recovery (RUNNING rows left by a crash are re-dispatched).
    pub fn queued_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(b"queue:", rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(b"queue:") {
                break;
            }
            let id_str = String::from_utf8_lossy(&value);
            let Ok(id) = Uuid::parse_str(&id_str) else {
                continue;
            };
            match self.get_task(&id)? {
                Some(task) if !task.status.is_terminal() => tasks.push(task),
                // Stale queue entry for a finished or vanished task
                _ => self.delete_row(&String::from_utf8_lossy(&key))?,
            }
        }
        Ok(tasks)
    }

    pub fn queue_depth(&self) -> Result<usize> {
        Ok(self.queued_tasks()?.len())
    }

    /// Reset tasks left RUNNING by a previous process back to PENDING.
    pub fn recover_running_tasks(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut task in self.queued_tasks()? {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                self.put_task(&task)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    fn idem_key(owner: &OwnerId, segment_id: &str) -> String {
        format!("idem:{}:{}", owner.partition_key(), segment_id)
    }

    pub fn put_idempotency(&self, owner: &OwnerId, segment_id: &str, task_id: Uuid) -> Result<()> {
        self.put_row(
            &Self::idem_key(owner, segment_id),
            &IdempotencyRecord {
                task_id,
                created_at: Utc::now(),
            },
        )
    }

    /// Look up a segment id within the idempotency window. Expired entries
    /// are dropped on read.
    pub fn get_idempotency(&self, owner: &OwnerId, segment_id: &str) -> Result<Option<Uuid>> {
        let key = Self::idem_key(owner, segment_id);
        match self.get_row::<IdempotencyRecord>(&key)? {
            Some(record) => {
                let age = Utc::now().signed_duration_since(record.created_at);
                if age > Duration::hours(IDEMPOTENCY_WINDOW_HOURS) {
                    self.delete_row(&key)?;
                    Ok(None)
                } else {
                    Ok(Some(record.task_id))
                }
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // API keys and agents
    // =========================================================================

    pub fn put_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        self.put_row(&format!("key:{}", record.key_hash), record)
    }

    pub fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        self.get_row(&format!("key:{key_hash}"))
    }

    pub fn delete_api_key(&self, key_hash: &str) -> Result<()> {
        self.delete_row(&format!("key:{key_hash}"))
    }

    pub fn touch_api_key(&self, key_hash: &str) -> Result<()> {
        if let Some(mut record) = self.api_key_by_hash(key_hash)? {
            record.last_used_at = Some(Utc::now());
            self.put_api_key(&record)?;
        }
        Ok(())
    }

    pub fn put_agent(&self, record: &AgentRecord) -> Result<()> {
        self.put_row(&format!("agent:{}", record.fingerprint), record)
    }

    pub fn agent_by_fingerprint(&self, fingerprint: &str) -> Result<Option<AgentRecord>> {
        self.get_row(&format!("agent:{fingerprint}"))
    }

    // =========================================================================
    // Quotas
    // =========================================================================

    pub fn get_quota(&self, user_id: &str) -> Result<Option<QuotaRecord>> {
        self.get_row(&format!("quota:{user_id}"))
    }

    pub fn put_quota(&self, record: &QuotaRecord) -> Result<()> {
        self.put_row(&format!("quota:{}", record.user_id), record)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn flush(&self) -> Result<()> {
        use rocksdb::FlushOptions;
        let mut opts = FlushOptions::default();
        opts.set_wait(true);
        self.db
            .flush_opt(&opts)
            .map_err(|e| anyhow!("flush relational store: {e}"))
    }
}
