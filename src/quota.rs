//! Subscription tiers and daily quotas.
//!
//! Searches are capped per UTC day; memories are capped per user. Quota is
//! consumed once per accepted (non-4xx) search request; a rejected request
//! consumes nothing.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{AppError, Result};
use crate::store::relational::RelationalStore;

/// Subscription tier with its caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    /// Daily search cap.
    pub fn search_limit(&self) -> u32 {
        match self {
            Self::Free => 100,
            Self::Pro => 10_000,
        }
    }

    /// Total stored-memory cap.
    pub fn memory_limit(&self) -> u64 {
        match self {
            Self::Free => 1_000,
            Self::Pro => 100_000,
        }
    }
}

/// Durable per-user quota row. The search counter resets when the stored
/// day differs from the current UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub tier: Tier,
    pub day: NaiveDate,
    pub searches_used: u32,
}

impl QuotaRecord {
    fn fresh(user_id: &str, tier: Tier) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier,
            day: Utc::now().date_naive(),
            searches_used: 0,
        }
    }
}

/// Usage snapshot returned by the quota endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub tier: String,
    pub memories: UsagePair,
    pub searches: SearchUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsagePair {
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchUsage {
    pub used: u32,
    pub limit: u32,
    /// Next UTC midnight, RFC 3339.
    pub resets_at: String,
}

/// Quota accounting over the relational store. The mutex serializes the
/// read-modify-write of the counter row.
pub struct QuotaService {
    store: Arc<RelationalStore>,
    lock: Mutex<()>,
}

impl QuotaService {
    pub fn new(store: Arc<RelationalStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn load(&self, user_id: &str) -> Result<QuotaRecord> {
        let mut record = self
            .store
            .get_quota(user_id)
            .map_err(|e| AppError::StorageError(e.to_string()))?
            .unwrap_or_else(|| QuotaRecord::fresh(user_id, Tier::Free));

        let today = Utc::now().date_naive();
        if record.day != today {
            record.day = today;
            record.searches_used = 0;
        }
        Ok(record)
    }

    /// Consume one search unit. Fails with a quota error (and consumes
    /// nothing) when the daily cap is already reached.
    pub fn consume_search(&self, user_id: &str) -> Result<u32> {
        let _guard = self.lock.lock();
        let mut record = self.load(user_id)?;
        let limit = record.tier.search_limit();

        if record.searches_used >= limit {
            return Err(AppError::SearchQuotaExceeded { limit });
        }

        record.searches_used += 1;
        self.store
            .put_quota(&record)
            .map_err(|e| AppError::StorageError(e.to_string()))?;
        Ok(limit - record.searches_used)
    }

    /// Check the memory cap before accepting an ingest request.
    pub fn check_memory_cap(&self, user_id: &str, live_memories: u64) -> Result<()> {
        let record = self.load(user_id)?;
        let limit = record.tier.memory_limit();
        if live_memories >= limit {
            return Err(AppError::MemoryQuotaExceeded { limit });
        }
        Ok(())
    }

    /// Usage snapshot for the quota endpoint.
    pub fn usage(&self, user_id: &str, live_memories: u64) -> Result<QuotaUsage> {
        let record = self.load(user_id)?;
        Ok(QuotaUsage {
            tier: record.tier.as_str().to_string(),
            memories: UsagePair {
                used: live_memories,
                limit: record.tier.memory_limit(),
            },
            searches: SearchUsage {
                used: record.searches_used,
                limit: record.tier.search_limit(),
                resets_at: next_utc_midnight(),
            },
        })
    }

    pub fn set_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        let _guard = self.lock.lock();
        let mut record = self.load(user_id)?;
        record.tier = tier;
        self.store
            .put_quota(&record)
            .map_err(|e| AppError::StorageError(e.to_string()))
    }
}

fn next_utc_midnight() -> String {
    let now = Utc::now();
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    Utc.with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
