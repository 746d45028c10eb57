//! Durable client-side outbox over an embedded RocksDB directory.
//!
//! Four keyspaces mirror the schema of the client state store:
//! `config:` (key/value), `memq:` (memory queue), `convq:` (conversation
//! queue, insertion-ordered) and `dlq:` (dead letters). Local ids are
//! monotone across restarts.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::types::Role;

/// One queued memory write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMemory {
    pub local_id: u64,
    pub content: String,
    pub metadata: Option<String>,
    pub retry_count: u32,
    pub first_queued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// One queued conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub local_id: u64,
    pub segment_id: String,
    pub role: Role,
    pub content: String,
    pub tokens: u32,
    pub queued_at: DateTime<Utc>,
}

/// Per-segment delivery bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What a dead-letter row originally was.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeadPayload {
    Memory(QueuedMemory),
    Segment {
        segment_id: String,
        messages: Vec<QueuedMessage>,
    },
}

/// An item whose retries were exhausted; retained for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub payload: DeadPayload,
    pub error: String,
    pub first_queued_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
}

fn sync_writes() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

pub struct Outbox {
    db: Arc<DB>,
    seq_lock: Mutex<()>,
}

impl Outbox {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = Arc::new(DB::open(&opts, path)?);
        Ok(Self {
            db,
            seq_lock: Mutex::new(()),
        })
    }

    fn put_row<T: Serialize>(&self, key: &str, row: &T) -> Result<()> {
        let value = bincode::serialize(row).context("serialize outbox row")?;
        self.db
            .put_opt(key.as_bytes(), value, &sync_writes())
            .with_context(|| format!("put outbox row {key}"))?;
        Ok(())
    }

    fn scan_rows<T: for<'de> Deserialize<'de>>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
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
            let key_str = String::from_utf8_lossy(&key).into_owned();
            match bincode::deserialize(&value) {
                Ok(row) => rows.push((key_str, row)),
                Err(e) => tracing::warn!("Skipping undecodable outbox row {}: {}", key_str, e),
            }
        }
        Ok(rows)
    }

    pub fn remove_key(&self, key: &str) -> Result<()> {
        self.db
            .delete_opt(key.as_bytes(), &sync_writes())
            .with_context(|| format!("delete outbox row {key}"))?;
        Ok(())
    }

    /// Monotone local id, durable across restarts.
    pub fn next_local_id(&self) -> Result<u64> {
        let _guard = self.seq_lock.lock();
        let current = match self.db.get(b"config:seq")? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt outbox sequence counter"))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };
        let next = current + 1;
        self.db
            .put_opt(b"config:seq", next.to_be_bytes(), &sync_writes())?;
        Ok(next)
    }

    // =========================================================================
    // Config
    // =========================================================================

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .get(format!("config:{key}").as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .put_opt(
                format!("config:{key}").as_bytes(),
                value.as_bytes(),
                &sync_writes(),
            )
            .context("put config value")?;
        Ok(())
    }

    // =========================================================================
    // Memory queue
    // =========================================================================

    pub fn enqueue_memory(&self, content: &str, metadata: Option<String>) -> Result<u64> {
        let local_id = self.next_local_id()?;
        let item = QueuedMemory {
            local_id,
            content: content.to_string(),
            metadata,
            retry_count: 0,
            first_queued_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
        };
        self.put_row(&format!("memq:{local_id:020}"), &item)?;
        Ok(local_id)
    }

    /// All queued memories in insertion order.
    pub fn memory_items(&self) -> Result<Vec<(String, QueuedMemory)>> {
        self.scan_rows("memq:")
    }

    pub fn memory_count(&self) -> Result<usize> {
        Ok(self.memory_items()?.len())
    }

    pub fn update_memory_item(&self, key: &str, item: &QueuedMemory) -> Result<()> {
        self.put_row(key, item)
    }

    // =========================================================================
    // Conversation queue
    // =========================================================================

    pub fn enqueue_message(
        &self,
        segment_id: &str,
        role: Role,
        content: &str,
        tokens: u32,
    ) -> Result<u64> {
        let local_id = self.next_local_id()?;
        let message = QueuedMessage {
            local_id,
            segment_id: segment_id.to_string(),
            role,
            content: content.to_string(),
            tokens,
            queued_at: Utc::now(),
        };
        self.put_row(&format!("convq:{local_id:020}"), &message)?;
        Ok(local_id)
    }

    /// All queued messages in insertion order (which preserves per-segment
    /// message order).
    pub fn all_messages(&self) -> Result<Vec<(String, QueuedMessage)>> {
        self.scan_rows("convq:")
    }

    /// Messages of one segment, in insertion order.
    pub fn segment_messages(&self, segment_id: &str) -> Result<Vec<(String, QueuedMessage)>> {
        Ok(self
            .all_messages()?
            .into_iter()
            .filter(|(_, m)| m.segment_id == segment_id)
            .collect())
    }

    /// Segment ids in order of first appearance.
    pub fn segments(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for (_, message) in self.all_messages()? {
            if !out.contains(&message.segment_id) {
                out.push(message.segment_id);
            }
        }
        Ok(out)
    }

    pub fn segment_meta(&self, segment_id: &str) -> Result<SegmentMeta> {
        let key = format!("segmeta:{segment_id}");
        match self.db.get(key.as_bytes())? {
            Some(value) => bincode::deserialize(&value).context("deserialize segment meta"),
            None => Ok(SegmentMeta::default()),
        }
    }

    pub fn put_segment_meta(&self, segment_id: &str, meta: &SegmentMeta) -> Result<()> {
        self.put_row(&format!("segmeta:{segment_id}"), meta)
    }

    pub fn clear_segment(&self, segment_id: &str) -> Result<()> {
        for (key, _) in self.segment_messages(segment_id)? {
            self.remove_key(&key)?;
        }
        self.remove_key(&format!("segmeta:{segment_id}"))
    }

    // =========================================================================
    // Dead letters
    // =========================================================================

    pub fn push_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let seq = self.next_local_id()?;
        self.put_row(&format!("dlq:{seq:020}"), letter)
    }

    pub fn dead_letters(&self) -> Result<Vec<(String, DeadLetter)>> {
        self.scan_rows("dlq:")
    }

    /// Drop dead letters older than the retention window. Returns the
    /// number removed.
    pub fn sweep_dead_letters(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for (key, letter) in self.dead_letters()? {
            if letter.dead_at < cutoff {
                self.remove_key(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_ids_are_monotone_across_reopen() {
        let dir = TempDir::new().unwrap();
        let first = {
            let outbox = Outbox::open(dir.path()).unwrap();
            outbox.enqueue_memory("a", None).unwrap()
        };
        let outbox = Outbox::open(dir.path()).unwrap();
        let second = outbox.enqueue_memory("b", None).unwrap();
        assert!(second > first);
        assert_eq!(outbox.memory_count().unwrap(), 2);
    }

    #[test]
    fn segment_messages_preserve_insertion_order() {
        let dir = TempDir::new().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();

        outbox.enqueue_message("s1", Role::User, "first", 1).unwrap();
        outbox.enqueue_message("s2", Role::User, "other segment", 1).unwrap();
        outbox.enqueue_message("s1", Role::Assistant, "second", 1).unwrap();
        outbox.enqueue_message("s1", Role::User, "third", 1).unwrap();

        let messages = outbox.segment_messages("s1").unwrap();
        let contents: Vec<&str> = messages.iter().map(|(_, m)| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);

        assert_eq!(outbox.segments().unwrap(), vec!["s1", "s2"]);
    }

    #[test]
    fn clear_segment_removes_messages_and_meta() {
        let dir = TempDir::new().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        outbox.enqueue_message("s1", Role::User, "hello", 1).unwrap();
        outbox
            .put_segment_meta(
                "s1",
                &SegmentMeta {
                    retry_count: 2,
                    ..Default::default()
                },
            )
            .unwrap();

        outbox.clear_segment("s1").unwrap();
        assert!(outbox.segment_messages("s1").unwrap().is_empty());
        assert_eq!(outbox.segment_meta("s1").unwrap().retry_count, 0);
    }

    #[test]
    fn dead_letter_sweep_honors_retention() {
        let dir = TempDir::new().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();

        let old = DeadLetter {
            payload: DeadPayload::Memory(QueuedMemory {
                local_id: 1,
                content: "stale".to_string(),
                metadata: None,
                retry_count: 6,
                first_queued_at: Utc::now() - Duration::days(40),
                last_attempt_at: None,
                next_attempt_at: None,
            }),
            error: "server gone".to_string(),
            first_queued_at: Utc::now() - Duration::days(40),
            dead_at: Utc::now() - Duration::days(31),
        };
        let fresh = DeadLetter {
            dead_at: Utc::now(),
            ..old.clone()
        };
        outbox.push_dead_letter(&old).unwrap();
        outbox.push_dead_letter(&fresh).unwrap();

        assert_eq!(outbox.sweep_dead_letters(Duration::days(30)).unwrap(), 1);
        assert_eq!(outbox.dead_letters().unwrap().len(), 1);
    }
}
