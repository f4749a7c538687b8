use std::sync::Arc;

use crate::analytics::{self, AnalyticsHandle};
use crate::config::Config;
use crate::connection_pool::{establish_connection_pool, DbPool};
use crate::error::Result;
use crate::kv::Kv;
use crate::queue::Queues;
use crate::rate_limit::SourceRateLimiter;
use crate::scrapers::ScraperRegistry;

/// Everything a worker or handler needs, threaded explicitly. No client
/// lives in a global; cloning is cheap and shares the underlying pools.
#[derive(Clone)]
pub struct AppCtx {
    pub config: Arc<Config>,
    pub db: DbPool,
    pub db_read: DbPool,
    pub kv: Kv,
    pub queues: Queues,
    pub rate_limiter: SourceRateLimiter,
    pub scrapers: ScraperRegistry,
    pub analytics: AnalyticsHandle,
}

impl AppCtx {
    pub async fn initialize(config: Config) -> Result<AppCtx> {
        let db = establish_connection_pool(&config.database_url);
        let db_read = if config.database_read_url == config.database_url {
            db.clone()
        } else {
            establish_connection_pool(&config.database_read_url)
        };
        let kv = Kv::connect(&config).await?;
        let queues = Queues::new(kv.clone());
        let rate_limiter = SourceRateLimiter::new(kv.clone(), &config);
        let analytics = analytics::start(kv.clone());
        Ok(AppCtx {
            config: Arc::new(config),
            db,
            db_read,
            kv,
            queues,
            rate_limiter,
            scrapers: ScraperRegistry::with_default_sources(),
            analytics,
        })
    }
}
