use diesel::{sql_types, ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppCtx;
use crate::error::{Error, Result};
use crate::ingest::{self, IncomingChapter};
use crate::models::SeriesSource;
use crate::rate_limit::DEFAULT_MAX_WAIT;
use crate::scrapers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDemandOutcome {
    /// This call performed the scrape and sync.
    Synced,
    /// Another caller holds the per-series lock; no I/O was done here.
    AlreadyRunning,
}

#[derive(QueryableByName)]
struct LockRow {
    #[sql_type = "sql_types::Bool"]
    acquired: bool,
}

/// User-triggered "refresh now" for one series. A per-series advisory lock
/// makes concurrent requests single-flight: the loser returns immediately
/// without touching the source. The lock is held on this connection across
/// the scrape (it is not a transaction) and released on every path.
#[tracing::instrument(name = "On-demand series sync.", err, level = "info", skip(ctx))]
pub async fn sync_now(ctx: &AppCtx, series_id: Uuid) -> Result<OnDemandOutcome> {
    let conn = ctx.db.conn().await?;

    let lock: LockRow = diesel::sql_query(
        "SELECT pg_try_advisory_lock(hashtext($1::text)) AS acquired",
    )
    .bind::<sql_types::Text, _>(series_id.to_string())
    .get_result(&*conn)?;
    if !lock.acquired {
        info!("Another on-demand sync holds the lock; skipping.");
        return Ok(OnDemandOutcome::AlreadyRunning);
    }

    let outcome = sync_preferred_binding(ctx, series_id).await;

    let unlocked: Result<LockRow, diesel::result::Error> = diesel::sql_query(
        "SELECT pg_advisory_unlock(hashtext($1::text)) AS acquired",
    )
    .bind::<sql_types::Text, _>(series_id.to_string())
    .get_result(&*conn);
    if let Err(err) = unlocked {
        warn!(?err, "Failed to release advisory lock; it dies with the session.");
    }

    outcome.map(|_| OnDemandOutcome::Synced)
}

async fn sync_preferred_binding(ctx: &AppCtx, for_series: Uuid) -> Result<usize> {
    let binding: SeriesSource = {
        use crate::schema::series_sources::dsl::*;
        let conn = ctx.db_read.conn().await?;
        series_sources
            .filter(series_id.eq(for_series))
            .order_by(trust_score.desc())
            .first(&*conn)
            .optional()?
            .ok_or_else(|| {
                Error::NotFound(format!("series {} has no source bindings", for_series))
            })?
    };

    let scraper = ctx.scrapers.get(&binding.source_name).ok_or_else(|| {
        Error::InvalidInput(format!("unknown source {:?}", binding.source_name))
    })?;

    let acquired = ctx
        .rate_limiter
        .acquire(&binding.source_name, DEFAULT_MAX_WAIT)
        .await?;
    if !acquired {
        return Err(Error::RateLimited {
            source_name: binding.source_name.clone(),
            wait_ms: DEFAULT_MAX_WAIT.as_millis() as u64,
        });
    }

    let scraped =
        scrapers::scrape_series_guarded(&ctx.kv, scraper.as_ref(), &binding.source_id).await?;
    let chapters: Vec<IncomingChapter> = scraped.chapters.into_iter().map(Into::into).collect();
    ingest::sync_chapters(
        &ctx.db,
        for_series,
        &binding.source_name,
        &binding.source_id,
        &chapters,
    )
    .await
}
