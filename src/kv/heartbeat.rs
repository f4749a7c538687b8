use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::error::Result;

use super::Kv;

const HEARTBEAT_KEY: &str = "workers:heartbeat";
const WRITE_INTERVAL: Duration = Duration::from_secs(5);
const KEY_TTL_SECS: u64 = 10;
/// Readers tolerate one missed write before declaring the fleet offline.
const MAX_AGE_MS: i64 = 15_000;

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    timestamp: i64,
    pid: u32,
    health: String,
}

/// Periodically publish liveness for this worker process. Runs forever;
/// spawn it next to the worker pool.
pub async fn heartbeat_loop(kv: Kv) {
    let mut interval = tokio::time::interval(WRITE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let key = kv.key(HEARTBEAT_KEY);

    loop {
        interval.tick().await;
        let beat = Heartbeat {
            timestamp: Utc::now().timestamp_millis(),
            pid: std::process::id(),
            health: "ok".into(),
        };
        let payload = match serde_json::to_string(&beat) {
            Ok(p) => p,
            Err(err) => {
                warn!(?err, "Failed to serialize heartbeat.");
                continue;
            }
        };
        let mut conn = kv.conn();
        let written: Result<(), redis::RedisError> =
            conn.set_ex(&key, payload, KEY_TTL_SECS).await;
        if let Err(err) = written {
            warn!(?err, "Failed to write worker heartbeat.");
        }
    }
}

/// True iff some worker has reported within the freshness window.
pub async fn workers_online(kv: &Kv) -> Result<bool> {
    let key = kv.key(HEARTBEAT_KEY);
    let mut conn = kv.conn();
    let raw: Option<String> = conn.get(&key).await?;
    let beat: Heartbeat = match raw.and_then(|r| serde_json::from_str(&r).ok()) {
        Some(b) => b,
        None => return Ok(false),
    };
    Ok(heartbeat_is_fresh(beat.timestamp, Utc::now().timestamp_millis()))
}

fn heartbeat_is_fresh(beat_ms: i64, now_ms: i64) -> bool {
    now_ms - beat_ms < MAX_AGE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_window() {
        assert!(heartbeat_is_fresh(1_000, 1_000));
        assert!(heartbeat_is_fresh(1_000, 15_999));
        assert!(!heartbeat_is_fresh(1_000, 16_000));
    }
}
