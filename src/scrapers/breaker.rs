use redis::Script;

use crate::error::{Error, Result};
use crate::kv::Kv;

pub const FAILURE_THRESHOLD: i64 = 5;
pub const OPEN_COOLDOWN_MS: i64 = 60_000;

// State machine per source, shared across workers:
// closed -> open at FAILURE_THRESHOLD consecutive failures,
// open -> half_open after OPEN_COOLDOWN_MS,
// half_open -> closed on success, -> open on failure.
const PREFLIGHT_SCRIPT: &str = r#"
local state = redis.call("hget", KEYS[1], "state")
if state == false or state == "closed" or state == "half_open" then
    return "allow"
end
local opened = tonumber(redis.call("hget", KEYS[1], "opened_at"))
local now = tonumber(ARGV[1])
if opened ~= nil and now - opened >= tonumber(ARGV[2]) then
    redis.call("hset", KEYS[1], "state", "half_open")
    return "allow"
end
return "open"
"#;

const FAILURE_SCRIPT: &str = r#"
local fails = redis.call("hincrby", KEYS[1], "failures", 1)
local state = redis.call("hget", KEYS[1], "state")
if state == "half_open" or fails >= tonumber(ARGV[2]) then
    redis.call("hset", KEYS[1], "state", "open", "opened_at", ARGV[1])
end
redis.call("expire", KEYS[1], 3600)
return fails
"#;

fn breaker_key(kv: &Kv, source: &str) -> String {
    kv.key(&format!("breaker:{}", source))
}

/// Gate an outbound call. `CircuitOpen` short-circuits before any I/O; an
/// expired open window flips to half-open and lets one probe through.
pub async fn preflight(kv: &Kv, source: &str) -> Result<()> {
    let mut conn = kv.conn();
    let verdict: String = Script::new(PREFLIGHT_SCRIPT)
        .key(breaker_key(kv, source))
        .arg(chrono::Utc::now().timestamp_millis())
        .arg(OPEN_COOLDOWN_MS)
        .invoke_async(&mut conn)
        .await?;
    if verdict == "open" {
        return Err(Error::CircuitOpen(source.to_string()));
    }
    Ok(())
}

/// Any success fully resets the breaker.
pub async fn record_success(kv: &Kv, source: &str) -> Result<()> {
    let mut conn = kv.conn();
    let _: () = redis::cmd("DEL")
        .arg(breaker_key(kv, source))
        .query_async(&mut conn)
        .await?;
    Ok(())
}

pub async fn record_failure(kv: &Kv, source: &str) -> Result<()> {
    let mut conn = kv.conn();
    let fails: i64 = Script::new(FAILURE_SCRIPT)
        .key(breaker_key(kv, source))
        .arg(chrono::Utc::now().timestamp_millis())
        .arg(FAILURE_THRESHOLD)
        .invoke_async(&mut conn)
        .await?;
    if fails == FAILURE_THRESHOLD {
        tracing::warn!(source, "Circuit opened after consecutive failures.");
    }
    Ok(())
}

/// Pure mirror of the preflight decision, for reasoning and tests.
#[cfg(test)]
fn gate(state: Option<&str>, opened_at_ms: Option<i64>, now_ms: i64) -> &'static str {
    match state {
        None | Some("closed") | Some("half_open") => "allow",
        Some(_) => match opened_at_ms {
            Some(opened) if now_ms - opened >= OPEN_COOLDOWN_MS => "allow",
            _ => "open",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_source_is_closed() {
        assert_eq!(gate(None, None, 0), "allow");
    }

    #[test]
    fn open_blocks_until_cooldown_passes() {
        assert_eq!(gate(Some("open"), Some(1_000), 30_000), "open");
        assert_eq!(gate(Some("open"), Some(1_000), 60_999), "open");
        assert_eq!(gate(Some("open"), Some(1_000), 61_000), "allow");
    }

    #[test]
    fn half_open_lets_a_probe_through() {
        assert_eq!(gate(Some("half_open"), Some(1_000), 2_000), "allow");
    }
}
