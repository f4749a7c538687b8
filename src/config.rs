use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context, Result};

/// Per-source outbound budget. Values come from the defaults table in
/// `rate_limit`, overridden by `RATE_LIMIT_<SOURCE>=rps,burst,cooldownMs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub rps: f64,
    pub burst: f64,
    pub cooldown_ms: u64,
}

impl RateLimitConfig {
    /// Parse the `rps,burst,cooldownMs` triple used by env overrides.
    pub fn parse(raw: &str) -> Result<RateLimitConfig> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            bail!("expected rps,burst,cooldownMs but got {:?}", raw);
        }
        Ok(RateLimitConfig {
            rps: parts[0].parse().context("rps is not a number")?,
            burst: parts[1].parse().context("burst is not a number")?,
            cooldown_ms: parts[2].parse().context("cooldownMs is not a number")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Read-replica url; falls back to the primary when unset.
    pub database_read_url: String,
    pub redis_url: String,
    pub redis_sentinel_hosts: Vec<(String, u16)>,
    pub redis_sentinel_master_name: String,
    /// Key namespace segment: keys are `app:<env>:<domain>:...`.
    pub app_env: String,
    /// Per-process worker concurrency.
    pub worker_instances: usize,
    /// Source-name keyed overrides collected from `RATE_LIMIT_*` vars.
    pub rate_limit_overrides: HashMap<String, RateLimitConfig>,
    pub bind_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_read_url =
            env::var("DATABASE_READ_URL").unwrap_or_else(|_| database_url.clone());

        // Workers prefer their dedicated endpoint, then the API one, then
        // the shared url.
        let redis_url = env::var("REDIS_WORKER_URL")
            .or_else(|_| env::var("REDIS_API_URL"))
            .or_else(|_| env::var("REDIS_URL"))
            .context("one of REDIS_WORKER_URL, REDIS_API_URL, REDIS_URL must be set")?;

        let redis_sentinel_hosts = match env::var("REDIS_SENTINEL_HOSTS") {
            Ok(csv) => parse_sentinel_hosts(&csv)?,
            Err(_) => Vec::new(),
        };

        let worker_instances = match env::var("WORKER_INSTANCES") {
            Ok(n) => n.parse().context("WORKER_INSTANCES is not a number")?,
            Err(_) => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
        };

        Ok(Config {
            database_url,
            database_read_url,
            redis_url,
            redis_sentinel_hosts,
            redis_sentinel_master_name: env::var("REDIS_SENTINEL_MASTER_NAME")
                .unwrap_or_else(|_| "mymaster".into()),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "dev".into()),
            worker_instances,
            rate_limit_overrides: collect_rate_limit_overrides(env::vars()),
            bind_port: match env::var("PORT") {
                Ok(p) => p.parse().context("PORT is not a number")?,
                Err(_) => 3000,
            },
        })
    }
}

fn parse_sentinel_hosts(csv: &str) -> Result<Vec<(String, u16)>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (host, port) = entry
                .split_once(':')
                .with_context(|| format!("sentinel host {:?} is missing a port", entry))?;
            Ok((
                host.to_string(),
                port.parse()
                    .with_context(|| format!("bad sentinel port in {:?}", entry))?,
            ))
        })
        .collect()
}

/// `RATE_LIMIT_MANGADEX=0.5,3,2000` overrides the mangadex budget. The
/// source key is lowercased so it matches adapter names.
fn collect_rate_limit_overrides(
    vars: impl Iterator<Item = (String, String)>,
) -> HashMap<String, RateLimitConfig> {
    let mut overrides = HashMap::new();
    for (key, value) in vars {
        let source = match key.strip_prefix("RATE_LIMIT_") {
            Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
            _ => continue,
        };
        match RateLimitConfig::parse(&value) {
            Ok(cfg) => {
                overrides.insert(source, cfg);
            }
            Err(err) => {
                tracing::warn!(%key, %value, ?err, "Ignoring malformed rate limit override.");
            }
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_limit_triple() {
        let cfg = RateLimitConfig::parse("0.5, 3, 2000").unwrap();
        assert_eq!(cfg.rps, 0.5);
        assert_eq!(cfg.burst, 3.0);
        assert_eq!(cfg.cooldown_ms, 2000);
    }

    #[test]
    fn rejects_short_triple() {
        assert!(RateLimitConfig::parse("5,10").is_err());
        assert!(RateLimitConfig::parse("a,b,c").is_err());
    }

    #[test]
    fn collects_overrides_by_lowercased_source() {
        let vars = vec![
            ("RATE_LIMIT_MANGADEX".to_string(), "5,10,250".to_string()),
            ("RATE_LIMIT_".to_string(), "1,1,1".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
            ("RATE_LIMIT_COMICK".to_string(), "garbage".to_string()),
        ];
        let overrides = collect_rate_limit_overrides(vars.into_iter());
        assert_eq!(overrides.len(), 1);
        let md = overrides.get("mangadex").unwrap();
        assert_eq!(md.rps, 5.0);
        assert_eq!(md.burst, 10.0);
        assert_eq!(md.cooldown_ms, 250);
    }

    #[test]
    fn parses_sentinel_csv() {
        let hosts = parse_sentinel_hosts("redis-a:26379, redis-b:26379").unwrap();
        assert_eq!(
            hosts,
            vec![
                ("redis-a".to_string(), 26379),
                ("redis-b".to_string(), 26379)
            ]
        );
        assert!(parse_sentinel_hosts("redis-a").is_err());
    }
}
