use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::config::{Config, RateLimitConfig};
use crate::error::Result;
use crate::kv::{token_bucket, Kv};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// Built-in budgets per source. Overridable with
/// `RATE_LIMIT_<SOURCE>=rps,burst,cooldownMs`.
fn default_limits() -> HashMap<String, RateLimitConfig> {
    let mut limits = HashMap::new();
    limits.insert(
        "mangadex".to_string(),
        RateLimitConfig {
            rps: 5.0,
            burst: 10.0,
            cooldown_ms: 100,
        },
    );
    limits.insert(
        "mangapark".to_string(),
        RateLimitConfig {
            rps: 1.0,
            burst: 3.0,
            cooldown_ms: 500,
        },
    );
    limits.insert(
        "comick".to_string(),
        RateLimitConfig {
            rps: 2.0,
            burst: 5.0,
            cooldown_ms: 250,
        },
    );
    limits.insert(
        "mangasee".to_string(),
        RateLimitConfig {
            rps: 1.0,
            burst: 2.0,
            cooldown_ms: 1000,
        },
    );
    limits
}

const FALLBACK_LIMIT: RateLimitConfig = RateLimitConfig {
    rps: 0.5,
    burst: 1.0,
    cooldown_ms: 2000,
};

/// Outbound budget keeper. Holds only configuration; the actual token
/// state lives in the KV store so every worker shares one budget per
/// source.
#[derive(Clone)]
pub struct SourceRateLimiter {
    kv: Kv,
    limits: HashMap<String, RateLimitConfig>,
}

impl SourceRateLimiter {
    pub fn new(kv: Kv, config: &Config) -> SourceRateLimiter {
        let mut limits = default_limits();
        for (source, cfg) in &config.rate_limit_overrides {
            limits.insert(source.clone(), *cfg);
        }
        SourceRateLimiter { kv, limits }
    }

    pub fn limit_for(&self, source: &str) -> RateLimitConfig {
        self.limits.get(source).copied().unwrap_or(FALLBACK_LIMIT)
    }

    /// Acquire one request slot for `source`, waiting up to `max_wait`.
    /// Returns false when the deadline passes; the caller must surface
    /// back-pressure (a retryable error) rather than proceed.
    pub async fn acquire(&self, source: &str, max_wait: Duration) -> Result<bool> {
        let limit = self.limit_for(source);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let grant = token_bucket::take(
                &self.kv,
                source,
                limit.rps,
                limit.burst,
                Utc::now().timestamp_millis(),
            )
            .await?;

            if grant.acquired {
                // Minimum inter-request gap, independent of burst. Polite
                // even when tokens are plentiful.
                tokio::time::sleep(Duration::from_millis(limit.cooldown_ms)).await;
                return Ok(true);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(source, "Rate limit acquire deadline exceeded.");
                return Ok(false);
            }
            let remaining = deadline - now;
            let wait = Duration::from_millis(grant.wait_ms).min(remaining);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_adapter() {
        let limits = default_limits();
        for source in ["mangadex", "mangapark", "comick", "mangasee"] {
            assert!(limits.contains_key(source), "missing budget for {}", source);
        }
    }

    #[test]
    fn unknown_sources_get_the_conservative_fallback() {
        let limits = default_limits();
        assert!(limits.get("weirdsource").is_none());
        assert_eq!(FALLBACK_LIMIT.rps, 0.5);
        assert_eq!(FALLBACK_LIMIT.cooldown_ms, 2000);
    }
}
