use tracing::info;

use crate::context::AppCtx;
use crate::error::Result;
use crate::ingest::{self, IncomingChapter};
use crate::queue::{self, JobOptions, JobPriority};

use super::{job_ids, ChapterIngestPayload, NotificationFanoutPayload};

/// Ingest one discovered chapter. Fan-out is enqueued only when the
/// logical chapter row was actually created, so a replayed job cannot
/// notify twice.
#[tracing::instrument(
    name = "Ingesting a discovered chapter.",
    err,
    level = "info",
    skip(ctx, payload),
    fields(
        series = %payload.series_id,
        source = %payload.source_name,
        chapter = payload.chapter_number
    )
)]
pub async fn run(ctx: &AppCtx, payload: ChapterIngestPayload) -> Result<()> {
    let chapter = IncomingChapter {
        chapter_number: payload.chapter_number,
        chapter_title: payload.chapter_title.clone(),
        chapter_url: payload.chapter_url.clone(),
        scanlation_group: payload.scanlation_group.clone(),
        language: payload.language.clone(),
        published_at: payload.published_at,
    };

    let upserted = ingest::ingest_single_chapter(
        &ctx.db,
        payload.series_id,
        payload.series_source_id,
        &chapter,
    )
    .await?;

    if !upserted.newly_inserted {
        info!("Chapter already known; nothing to announce.");
        return Ok(());
    }

    let fanout = NotificationFanoutPayload {
        series_id: payload.series_id,
        series_source_id: payload.series_source_id,
        chapter_number: payload.chapter_number,
        source_name: payload.source_name.clone(),
    };
    ctx.queues
        .add(
            queue::NOTIFICATION_FANOUT,
            serde_json::to_value(&fanout).expect("payload serializes"),
            JobOptions::new(
                job_ids::fanout(payload.series_id, payload.chapter_number),
                JobPriority::Hot,
            ),
        )
        .await?;
    Ok(())
}
