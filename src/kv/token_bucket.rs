use redis::Script;

use crate::error::Result;

use super::Kv;

// Refill-then-take in one round trip. Token count and refill stamp are two
// keys sharing a sliding 1-hour TTL; an idle source costs nothing.
const TAKE_SCRIPT: &str = r#"
local tokens = tonumber(redis.call("get", KEYS[1]))
local last = tonumber(redis.call("get", KEYS[2]))
local rps = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

if tokens == nil then tokens = burst end
if last == nil then last = now end

local elapsed = now - last
if elapsed < 0 then elapsed = 0 end
tokens = tokens + elapsed * rps / 1000.0
if tokens > burst then tokens = burst end

local wait = 0
if tokens >= 1 then
    tokens = tokens - 1
else
    wait = math.ceil((1 - tokens) / rps * 1000.0)
end

redis.call("set", KEYS[1], tokens, "EX", 3600)
redis.call("set", KEYS[2], now, "EX", 3600)
return {tostring(wait == 0 and 1 or 0), tostring(wait)}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGrant {
    pub acquired: bool,
    /// When not acquired, how long until a token will be available.
    pub wait_ms: u64,
}

/// Take one token from the shared per-source bucket, refilling by elapsed
/// time first. Never blocks; the caller decides whether to sleep `wait_ms`.
pub async fn take(kv: &Kv, source: &str, rps: f64, burst: f64, now_ms: i64) -> Result<TokenGrant> {
    let tokens_key = kv.key(&format!("ratelimit:{}:tokens", source));
    let stamp_key = kv.key(&format!("ratelimit:{}:last_refill", source));
    let mut conn = kv.conn();
    let (granted, wait): (String, String) = Script::new(TAKE_SCRIPT)
        .key(&tokens_key)
        .key(&stamp_key)
        .arg(rps)
        .arg(burst)
        .arg(now_ms)
        .invoke_async(&mut conn)
        .await?;
    Ok(TokenGrant {
        acquired: granted == "1",
        wait_ms: wait.parse::<f64>().unwrap_or(0.0) as u64,
    })
}
