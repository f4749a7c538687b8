use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use diesel::{sql_types, ExpressionMethods, QueryDsl, RunQueryDsl};
use itertools::Itertools;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::AppCtx;
use crate::error::{Error, ErrorKind, Result};
use crate::kv::{heartbeat, lock};
use crate::models::{SeriesSource, SyncPriority};
use crate::queue::{self, JobOptions};
use crate::search::deferred;
use crate::search::{enqueue_external, heat, intent};
use crate::workers::{job_ids, CheckSourcePayload, CoverRefreshPayload, TRIGGER_SCHEDULED};

const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MASTER_LOCK_TTL: Duration = Duration::from_secs(60);
const MASTER_LOCK_NAME: &str = "scheduler:master";

/// Follower count above which a binding is promoted to HOT.
pub const HOT_FOLLOWER_THRESHOLD: i64 = 100;
/// Due bindings picked up per tick.
pub const SYNC_BATCH_LIMIT: i64 = 500;
const DEFERRED_SAMPLE_SIZE: usize = 10;
const COVER_REFRESH_BATCH: i64 = 100;

const FREE_DELIVERY_CRITICAL_WAITING: u64 = 10_000;
const FREE_DELIVERY_CRITICAL_AGE_MS: i64 = 5 * 60 * 1000;
const TOTAL_WAITING_WARNING: u64 = 50_000;

/// Periodic maintenance loop. Every instance runs it, but the master lock
/// lets only one fleet member do the work per tick; the rest fail fast.
pub async fn scheduler_loop(ctx: AppCtx) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let tick_ctx = ctx.clone();
        let outcome = lock::with_lock(&ctx.kv, MASTER_LOCK_NAME, MASTER_LOCK_TTL, move || async move {
            master_tick(&tick_ctx).await
        })
        .await;
        match outcome {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Conflict => {
                debug!("Another scheduler instance holds the master lock.");
            }
            Err(err) => {
                error!(?err, "Scheduler tick failed.");
            }
        }
    }
}

#[tracing::instrument(name = "Master scheduler tick.", err, level = "info", skip(ctx))]
async fn master_tick(ctx: &AppCtx) -> Result<()> {
    if let Err(err) = maintain_priorities(ctx).await {
        warn!(?err, "Priority maintenance failed; continuing tick.");
    }
    if let Err(err) = enqueue_cover_refreshes(ctx).await {
        warn!(?err, "Cover refresh enqueue failed; continuing tick.");
    }
    if let Err(err) = retry_deferred_searches(ctx).await {
        warn!(?err, "Deferred search retry failed; continuing tick.");
    }
    if let Err(err) = safety_monitor(ctx).await {
        warn!(?err, "Safety monitor failed; continuing tick.");
    }
    enqueue_due_syncs(ctx).await
}

/// Move bindings between tiers based on follower counts and staleness.
async fn maintain_priorities(ctx: &AppCtx) -> Result<()> {
    let conn = ctx.db.conn().await?;

    let promoted = diesel::sql_query(
        "UPDATE series_sources ss SET sync_priority = 'HOT' \
         FROM series s \
         WHERE s.id = ss.series_id \
           AND s.total_follows > $1 \
           AND ss.sync_priority <> 'HOT'",
    )
    .bind::<sql_types::BigInt, _>(HOT_FOLLOWER_THRESHOLD)
    .execute(&*conn)?;

    let demoted_warm = diesel::sql_query(
        "UPDATE series_sources ss SET sync_priority = 'WARM' \
         FROM series s \
         WHERE s.id = ss.series_id \
           AND ss.sync_priority = 'HOT' \
           AND ss.last_success_at < now() - interval '24 hours' \
           AND s.total_follows <= $1",
    )
    .bind::<sql_types::BigInt, _>(HOT_FOLLOWER_THRESHOLD)
    .execute(&*conn)?;

    let demoted_cold = diesel::sql_query(
        "UPDATE series_sources SET sync_priority = 'COLD' \
         WHERE sync_priority = 'WARM' \
           AND last_success_at < now() - interval '7 days'",
    )
    .execute(&*conn)?;

    info!(promoted, demoted_warm, demoted_cold, "Priority maintenance done.");
    Ok(())
}

async fn enqueue_cover_refreshes(ctx: &AppCtx) -> Result<()> {
    use crate::schema::series::dsl::*;
    let missing: Vec<Uuid> = {
        let conn = ctx.db_read.conn().await?;
        series
            .filter(best_cover_url.is_null())
            .order_by(total_follows.desc())
            .select(id)
            .limit(COVER_REFRESH_BATCH)
            .load(&*conn)?
    };
    let jobs = missing
        .into_iter()
        .map(|series_id| {
            (
                serde_json::to_value(&CoverRefreshPayload { series_id })
                    .expect("payload serializes"),
                JobOptions::new(job_ids::cover_refresh(series_id), queue::JobPriority::Low),
            )
        })
        .collect::<Vec<_>>();
    if !jobs.is_empty() {
        let added = ctx.queues.add_bulk(queue::COVER_REFRESH, jobs).await?;
        debug!(added, "Enqueued cover refreshes.");
    }
    Ok(())
}

/// Pull a random slice of parked searches and give the eligible ones
/// another shot. Requires a healthy system; an unhealthy one would only
/// re-defer everything it touched.
async fn retry_deferred_searches(ctx: &AppCtx) -> Result<()> {
    if !heartbeat::workers_online(&ctx.kv).await?
        || !ctx.queues.is_healthy(queue::CHECK_SOURCE).await?
    {
        debug!("System unhealthy; leaving deferred searches parked.");
        return Ok(());
    }

    let now = Utc::now().timestamp_millis();
    for (hash, mut entry) in deferred::sample(&ctx.kv, DEFERRED_SAMPLE_SIZE).await? {
        if entry.is_expired(now) {
            deferred::remove(&ctx.kv, &hash).await?;
            continue;
        }
        entry.retry_count += 1;
        if entry.is_exhausted() {
            info!(query_hash = %hash, "Deferred search exhausted its retries; dropping.");
            deferred::remove(&ctx.kv, &hash).await?;
            continue;
        }

        // Heat was never proven for low-heat deferrals; re-check it. The
        // health-related reasons validated heat at original dispatch.
        if entry.requires_heat_recheck() {
            let sample = heat::sample(&ctx.kv, &hash).await?;
            if !heat::is_hot(sample) {
                deferred::update(&ctx.kv, &hash, &entry).await?;
                continue;
            }
        }

        enqueue_external(
            ctx,
            &entry.query,
            &hash,
            entry.is_premium,
            intent::detect(&entry.query),
        )
        .await?;
        deferred::remove(&ctx.kv, &hash).await?;
        info!(query_hash = %hash, retry = entry.retry_count, "Re-dispatched deferred search.");
    }
    Ok(())
}

/// Log loudly when the notification pipeline is drowning.
async fn safety_monitor(ctx: &AppCtx) -> Result<()> {
    let free = ctx.queues.counts(queue::NOTIFICATION_DELIVERY).await?;
    if free.waiting > FREE_DELIVERY_CRITICAL_WAITING
        || free
            .oldest_waiting_age_ms
            .map(|age| age > FREE_DELIVERY_CRITICAL_AGE_MS)
            .unwrap_or(false)
    {
        error!(
            waiting = free.waiting,
            oldest_ms = ?free.oldest_waiting_age_ms,
            "CRITICAL: free delivery queue is drowning."
        );
    }
    let total = ctx.queues.total_waiting().await?;
    if total > TOTAL_WAITING_WARNING {
        warn!(total, "Total queue backlog is high.");
    }
    Ok(())
}

/// Find due bindings and enqueue their syncs. `next_check_at` is advanced
/// BEFORE enqueueing: if the enqueue fails the next tick retries cleanly,
/// and the deterministic job id suppresses any still-in-flight duplicate.
async fn enqueue_due_syncs(ctx: &AppCtx) -> Result<()> {
    let conn = ctx.db.conn().await?;
    let due: Vec<SeriesSource> = diesel::sql_query(
        "SELECT * FROM series_sources \
         WHERE next_check_at <= now() OR next_check_at IS NULL \
         ORDER BY next_check_at ASC NULLS FIRST \
         LIMIT $1",
    )
    .bind::<sql_types::BigInt, _>(SYNC_BATCH_LIMIT)
    .load(&*conn)?;
    if due.is_empty() {
        return Ok(());
    }

    let by_priority: HashMap<SyncPriority, Vec<&SeriesSource>> = due
        .iter()
        .into_group_map_by(|source| source.sync_priority);

    for (priority, sources) in &by_priority {
        let ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
        let next = Utc::now()
            + chrono::Duration::from_std(priority.interval())
                .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        use crate::schema::series_sources::dsl::*;
        diesel::update(series_sources.filter(id.eq_any(&ids)))
            .set(next_check_at.eq(next))
            .execute(&*conn)?;
    }

    let mut enqueued = 0;
    for (priority, sources) in by_priority {
        let jobs = sources
            .into_iter()
            .map(|source| {
                let payload = CheckSourcePayload {
                    source_name: source.source_name.clone(),
                    trigger: TRIGGER_SCHEDULED.into(),
                    query: None,
                    series_id: Some(source.series_id),
                    series_source_id: Some(source.id),
                    source_id: Some(source.source_id.clone()),
                };
                (
                    serde_json::to_value(&payload).expect("payload serializes"),
                    JobOptions::with_priority_value(
                        job_ids::sync(source.id),
                        priority.queue_priority(),
                    ),
                )
            })
            .collect::<Vec<_>>();
        enqueued += ctx.queues.add_bulk(queue::SYNC_SOURCE, jobs).await?;
    }

    info!(due = due.len(), enqueued, "Sync enqueue complete.");
    Ok(())
}
