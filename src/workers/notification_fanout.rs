use diesel::{sql_types, RunQueryDsl};
use itertools::Itertools;
use tracing::info;
use uuid::Uuid;

use crate::context::AppCtx;
use crate::error::Result;
use crate::queue::{self, JobOptions, JobPriority};

use super::{job_ids, NotificationDeliveryPayload, NotificationFanoutPayload};

/// Recipients per delivery job.
pub const DELIVERY_CHUNK_SIZE: usize = 500;

#[derive(QueryableByName)]
struct Subscriber {
    #[sql_type = "sql_types::Uuid"]
    user_id: Uuid,
    #[sql_type = "sql_types::Bool"]
    is_premium: bool,
}

/// Select everyone who should hear about a new chapter and chunk them into
/// delivery jobs, premium tier first.
///
/// The read filter here is pre-emptive: anyone who already has a read fact
/// for this (series, chapter number) is excluded before a delivery job is
/// even created. Delivery re-checks, closing the remaining latency gap.
#[tracing::instrument(
    name = "Fanning out a new chapter.",
    err,
    level = "info",
    skip(ctx, payload),
    fields(series = %payload.series_id, chapter = payload.chapter_number)
)]
pub async fn run(ctx: &AppCtx, payload: NotificationFanoutPayload) -> Result<()> {
    let subscribers = eligible_subscribers(ctx, &payload).await?;
    if subscribers.is_empty() {
        info!("No eligible subscribers.");
        return Ok(());
    }

    let (premium, free): (Vec<_>, Vec<_>) =
        subscribers.into_iter().partition(|s| s.is_premium);
    let mut enqueued = 0;

    for (tier_premium, tier_users, tier_queue, tier_priority) in [
        (
            true,
            premium,
            queue::NOTIFICATION_DELIVERY_PREMIUM,
            JobPriority::Critical,
        ),
        (
            false,
            free,
            queue::NOTIFICATION_DELIVERY,
            JobPriority::Standard,
        ),
    ] {
        for (chunk_index, chunk) in tier_users
            .iter()
            .chunks(DELIVERY_CHUNK_SIZE)
            .into_iter()
            .enumerate()
        {
            let delivery = NotificationDeliveryPayload {
                series_id: payload.series_id,
                series_source_id: payload.series_source_id,
                chapter_number: payload.chapter_number,
                source_name: payload.source_name.clone(),
                user_ids: chunk.map(|s| s.user_id).collect(),
                is_premium: tier_premium,
            };
            ctx.queues
                .add(
                    tier_queue,
                    serde_json::to_value(&delivery).expect("payload serializes"),
                    JobOptions::new(
                        job_ids::delivery(
                            payload.series_id,
                            payload.chapter_number,
                            tier_premium,
                            chunk_index,
                        ),
                        tier_priority,
                    ),
                )
                .await?;
            enqueued += 1;
        }
    }

    info!(delivery_jobs = enqueued, "Fan-out complete.");
    Ok(())
}

/// Library entries that want to hear about this chapter: not dropped,
/// notifications on, series rating within the user's cap, and no read
/// fact for this (series, chapter number) yet.
async fn eligible_subscribers(
    ctx: &AppCtx,
    payload: &NotificationFanoutPayload,
) -> Result<Vec<Subscriber>> {
    let conn = ctx.db_read.conn().await?;
    let rows: Vec<Subscriber> = diesel::sql_query(
        "SELECT le.user_id, u.is_premium \
         FROM library_entries le \
         JOIN users u ON u.id = le.user_id \
         JOIN series s ON s.id = le.series_id \
         WHERE le.series_id = $1 \
           AND le.status <> 'dropped' \
           AND le.notify_new_chapters \
           AND CASE u.content_rating_cap \
                 WHEN 'safe' THEN 1 WHEN 'suggestive' THEN 2 \
                 WHEN 'erotica' THEN 3 ELSE 4 END \
               >= CASE s.content_rating \
                 WHEN 'safe' THEN 1 WHEN 'suggestive' THEN 2 \
                 WHEN 'erotica' THEN 3 ELSE 4 END \
           AND NOT EXISTS ( \
                 SELECT 1 FROM user_chapter_reads r \
                 WHERE r.user_id = le.user_id \
                   AND r.series_id = le.series_id \
                   AND r.chapter_number = $2)",
    )
    .bind::<sql_types::Uuid, _>(payload.series_id)
    .bind::<sql_types::Double, _>(payload.chapter_number)
    .load(&*conn)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_is_bounded_and_complete() {
        let users: Vec<usize> = (0..1_201).collect();
        let chunks: Vec<Vec<usize>> = users
            .iter()
            .chunks(DELIVERY_CHUNK_SIZE)
            .into_iter()
            .map(|c| c.copied().collect())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 500);
        assert_eq!(chunks[2].len(), 201);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 1_201);
    }
}
