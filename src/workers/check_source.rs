use std::collections::HashSet;

use diesel::{ExpressionMethods, JoinOnDsl, QueryDsl, RunQueryDsl};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::Event;
use crate::context::AppCtx;
use crate::error::{Error, ErrorKind, Result};
use crate::ingest::{self, IncomingChapter};
use crate::queue::{self, JobOptions, JobPriority};
use crate::rate_limit::DEFAULT_MAX_WAIT;
use crate::scrapers;

use super::{job_ids, CanonicalizePayload, ChapterIngestPayload, CheckSourcePayload};

/// Resolve a check-source job: search mode fans hits out to canonicalize,
/// sync mode refreshes one binding's catalog.
#[tracing::instrument(
    name = "Checking an external source.",
    err,
    level = "info",
    skip(ctx, payload),
    fields(source = %payload.source_name, trigger = %payload.trigger)
)]
pub async fn run(ctx: &AppCtx, payload: CheckSourcePayload) -> Result<()> {
    let scraper = ctx
        .scrapers
        .get(&payload.source_name)
        .ok_or_else(|| Error::InvalidInput(format!("unknown source {:?}", payload.source_name)))?;

    // Shared outbound budget first. A timed-out acquire is back-pressure,
    // not failure; the queue reschedules with backoff.
    let acquired = ctx
        .rate_limiter
        .acquire(&payload.source_name, DEFAULT_MAX_WAIT)
        .await?;
    if !acquired {
        return Err(Error::RateLimited {
            source_name: payload.source_name.clone(),
            wait_ms: DEFAULT_MAX_WAIT.as_millis() as u64,
        });
    }

    match (&payload.series_id, &payload.query) {
        (Some(series_id), _) => sync_binding(ctx, &payload, *series_id, scraper.as_ref()).await,
        (None, Some(query)) => search_catalog(ctx, &payload, query, scraper.as_ref()).await,
        (None, None) => Err(Error::InvalidInput(
            "check-source job carries neither a series nor a query".into(),
        )),
    }
}

async fn search_catalog(
    ctx: &AppCtx,
    payload: &CheckSourcePayload,
    query: &str,
    scraper: &dyn scrapers::Scraper,
) -> Result<()> {
    let hits = scrapers::search_guarded(&ctx.kv, scraper, query).await?;
    info!(hits = hits.len(), "Catalog search returned hits.");

    for hit in hits {
        let job_id = job_ids::canonicalize(&payload.source_name, &hit.source_id);
        let canonicalize = CanonicalizePayload {
            source_name: payload.source_name.clone(),
            source_id: hit.source_id,
            title: hit.title,
            alt_titles: hit.alt_titles,
            cover_url: hit.cover_url,
            content_rating: None,
        };
        ctx.queues
            .add(
                queue::CANONICALIZE,
                serde_json::to_value(&canonicalize).expect("payload serializes"),
                JobOptions::new(job_id, JobPriority::Standard),
            )
            .await?;
    }
    Ok(())
}

async fn sync_binding(
    ctx: &AppCtx,
    payload: &CheckSourcePayload,
    series_id: Uuid,
    scraper: &dyn scrapers::Scraper,
) -> Result<()> {
    let source_id = payload
        .source_id
        .as_deref()
        .ok_or_else(|| Error::InvalidInput("sync job is missing the provider-local id".into()))?;
    let series_source_id = payload.series_source_id.ok_or_else(|| {
        Error::InvalidInput("sync job is missing the series_source binding id".into())
    })?;

    let scraped = match scrapers::scrape_series_guarded(&ctx.kv, scraper, source_id).await {
        Ok(scraped) => scraped,
        Err(err) => {
            // Health bookkeeping for the priority maintainer; breaker and
            // retry policy are handled elsewhere.
            if err.kind() != ErrorKind::CircuitOpen {
                if let Err(mark_err) = ingest::mark_source_failure(&ctx.db, series_source_id).await
                {
                    warn!(?mark_err, "Failed to record source failure.");
                }
            }
            return Err(err);
        }
    };

    let known = known_chapter_numbers(ctx, series_source_id).await?;
    let fresh: Vec<_> = scraped
        .chapters
        .iter()
        .filter(|c| !known.contains(&c.chapter_number.to_bits()))
        .cloned()
        .collect();

    // First contact (or a source we have nothing from) is a backfill: one
    // bulk transaction, no per-chapter notifications for a 500-chapter
    // history dump.
    if known.is_empty() {
        let chapters: Vec<IncomingChapter> =
            scraped.chapters.iter().cloned().map(Into::into).collect();
        let processed = ingest::sync_chapters(
            &ctx.db,
            series_id,
            &payload.source_name,
            source_id,
            &chapters,
        )
        .await?;
        info!(processed, "Backfilled chapter catalog.");
    } else {
        for chapter in &fresh {
            let ingest_payload = ChapterIngestPayload {
                series_id,
                series_source_id,
                source_name: payload.source_name.clone(),
                chapter_number: chapter.chapter_number,
                chapter_title: chapter.chapter_title.clone(),
                chapter_url: chapter.chapter_url.clone(),
                language: chapter.language.clone(),
                scanlation_group: chapter.scanlation_group.clone(),
                published_at: chapter.published_at,
            };
            ctx.queues
                .add(
                    queue::CHAPTER_INGEST,
                    serde_json::to_value(&ingest_payload).expect("payload serializes"),
                    JobOptions::new(
                        job_ids::chapter_ingest(series_source_id, chapter.chapter_number),
                        JobPriority::Hot,
                    ),
                )
                .await?;
        }
        ingest::mark_source_checked(&ctx.db, series_source_id, scraped.chapters.len()).await?;
    }

    ctx.analytics.record(Event::SyncCompleted {
        source: scraper.name(),
        chapters: fresh.len(),
    });
    Ok(())
}

/// Chapter numbers already linked to this binding, as bit patterns so they
/// can live in a HashSet.
async fn known_chapter_numbers(ctx: &AppCtx, binding: Uuid) -> Result<HashSet<u64>> {
    use crate::schema::{chapter_sources, logical_chapters};
    let conn = ctx.db_read.conn().await?;
    let numbers: Vec<f64> = chapter_sources::table
        .inner_join(
            logical_chapters::table.on(chapter_sources::chapter_id.eq(logical_chapters::id)),
        )
        .filter(chapter_sources::series_source_id.eq(binding))
        .select(logical_chapters::chapter_number)
        .load(&*conn)?;
    Ok(numbers.into_iter().map(f64::to_bits).collect())
}
