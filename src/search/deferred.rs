use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::Kv;

/// Deferred entries older than this are dropped unprocessed.
pub const DEFERRED_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;
/// A deferred query gets this many off-peak retries before it dies.
pub const MAX_RETRIES: u32 = 5;

pub const REASON_LOW_HEAT: &str = "low_heat";
pub const REASON_QUEUE_UNHEALTHY: &str = "queue_unhealthy";
pub const REASON_WORKERS_OFFLINE: &str = "workers_offline";
pub const REASON_CONCURRENCY_CAP: &str = "concurrency_cap";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredSearch {
    pub query: String,
    pub retry_count: u32,
    pub skip_reason: String,
    pub is_premium: bool,
    pub deferred_at: i64,
}

impl DeferredSearch {
    pub fn new(query: &str, skip_reason: &str, is_premium: bool) -> DeferredSearch {
        DeferredSearch {
            query: query.to_string(),
            retry_count: 0,
            skip_reason: skip_reason.to_string(),
            is_premium,
            deferred_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.deferred_at >= DEFERRED_TTL_MS
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRIES
    }

    /// Heat was already proven at dispatch time for health-related skips;
    /// only low-heat entries must re-qualify.
    pub fn requires_heat_recheck(&self) -> bool {
        self.skip_reason == REASON_LOW_HEAT
    }
}

fn entries_key(kv: &Kv) -> String {
    kv.key("search:deferred")
}

/// Park a query for off-peak retry. Re-deferring keeps the first entry so
/// retry counting is not reset by repeat traffic.
pub async fn defer(kv: &Kv, query_hash: &str, entry: &DeferredSearch) -> Result<bool> {
    let mut conn = kv.conn();
    let stored: bool = conn
        .hset_nx(
            entries_key(kv),
            query_hash,
            serde_json::to_string(entry).expect("entry serializes"),
        )
        .await?;
    Ok(stored)
}

pub async fn update(kv: &Kv, query_hash: &str, entry: &DeferredSearch) -> Result<()> {
    let mut conn = kv.conn();
    let _: () = conn
        .hset(
            entries_key(kv),
            query_hash,
            serde_json::to_string(entry).expect("entry serializes"),
        )
        .await?;
    Ok(())
}

pub async fn remove(kv: &Kv, query_hash: &str) -> Result<()> {
    let mut conn = kv.conn();
    let _: () = conn.hdel(entries_key(kv), query_hash).await?;
    Ok(())
}

/// Up to `n` random deferred entries. Random so a poisonous head cannot
/// starve the rest of the set.
pub async fn sample(kv: &Kv, n: usize) -> Result<Vec<(String, DeferredSearch)>> {
    let mut conn = kv.conn();
    let fields: Vec<String> = redis::cmd("HRANDFIELD")
        .arg(entries_key(kv))
        .arg(n as i64)
        .query_async(&mut conn)
        .await?;
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let raw: Option<String> = conn.hget(entries_key(kv), &field).await?;
        if let Some(entry) = raw.and_then(|r| serde_json::from_str(&r).ok()) {
            out.push((field, entry));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_and_exhaustion() {
        let mut entry = DeferredSearch::new("obscurename", REASON_LOW_HEAT, false);
        assert!(!entry.is_expired(entry.deferred_at + DEFERRED_TTL_MS - 1));
        assert!(entry.is_expired(entry.deferred_at + DEFERRED_TTL_MS));
        assert!(!entry.is_exhausted());
        entry.retry_count = MAX_RETRIES;
        assert!(entry.is_exhausted());
    }

    #[test]
    fn only_low_heat_rechecks() {
        assert!(DeferredSearch::new("x", REASON_LOW_HEAT, false).requires_heat_recheck());
        assert!(!DeferredSearch::new("x", REASON_QUEUE_UNHEALTHY, false).requires_heat_recheck());
        assert!(!DeferredSearch::new("x", REASON_WORKERS_OFFLINE, true).requires_heat_recheck());
    }
}
