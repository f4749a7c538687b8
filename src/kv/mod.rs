pub mod heartbeat;
pub mod lock;
pub mod token_bucket;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::Config;
use crate::error::Result;

/// Shared key-value client. All coordination state (locks, buckets, heat,
/// quotas, queues, heartbeats) lives behind this handle so every worker
/// process shares one budget. Keys are namespaced `app:<env>:<domain>:...`.
#[derive(Clone)]
pub struct Kv {
    conn: ConnectionManager,
    namespace: String,
}

impl Kv {
    pub async fn connect(config: &Config) -> Result<Kv> {
        let url = resolve_master_url(config).await?;
        let client = redis::Client::open(url.as_str())
            .map_err(crate::error::Error::from)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Kv {
            conn,
            namespace: format!("app:{}", config.app_env),
        })
    }

    /// Cheap clone of the underlying multiplexed connection.
    pub fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn key(&self, rest: &str) -> String {
        format!("{}:{}", self.namespace, rest)
    }
}

/// When sentinels are configured, ask them for the current master address;
/// otherwise use the configured url directly.
async fn resolve_master_url(config: &Config) -> Result<String> {
    if config.redis_sentinel_hosts.is_empty() {
        return Ok(config.redis_url.clone());
    }
    for (host, port) in &config.redis_sentinel_hosts {
        let sentinel_url = format!("redis://{}:{}", host, port);
        let client = match redis::Client::open(sentinel_url.as_str()) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let mut conn = match client.get_async_connection().await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%host, port, ?err, "Sentinel unreachable, trying next.");
                continue;
            }
        };
        let addr: Result<Vec<String>, _> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(&config.redis_sentinel_master_name)
            .query_async(&mut conn)
            .await;
        if let Ok(addr) = addr {
            if addr.len() == 2 {
                let url = format!("redis://{}:{}", addr[0], addr[1]);
                info!(master = %url, sentinel = %host, "Resolved redis master via sentinel.");
                return Ok(url);
            }
        }
    }
    Err(crate::error::Error::TransientDb(
        "no sentinel answered with a master address".into(),
    ))
}
