use std::collections::HashSet;

use diesel::pg::upsert::on_constraint;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl};
use tracing::info;
use uuid::Uuid;

use crate::analytics::Event;
use crate::context::AppCtx;
use crate::error::{Error, Result};
use crate::models::{NewNotification, NOTIFICATION_NEW_CHAPTER};

use super::NotificationDeliveryPayload;

/// Insert per-user notifications for one chunk of recipients. The natural
/// key (user, logical chapter, kind) plus ON CONFLICT DO NOTHING makes
/// replays and races write exactly one row per user.
#[tracing::instrument(
    name = "Delivering chapter notifications.",
    err,
    level = "info",
    skip(ctx, payload),
    fields(
        series = %payload.series_id,
        chapter = payload.chapter_number,
        recipients = payload.user_ids.len(),
        premium = payload.is_premium
    )
)]
pub async fn run(ctx: &AppCtx, payload: NotificationDeliveryPayload) -> Result<()> {
    if payload.user_ids.is_empty() {
        return Ok(());
    }
    let conn = ctx.db.conn().await?;

    let logical_chapter: Uuid = {
        use crate::schema::logical_chapters::dsl::*;
        logical_chapters
            .filter(series_id.eq(payload.series_id))
            .filter(chapter_number.eq(payload.chapter_number))
            .select(id)
            .first(&*conn)
            .optional()?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no logical chapter {} for series {}",
                    payload.chapter_number, payload.series_id
                ))
            })?
    };

    // Re-check read facts: fan-out filtered already, but a user can read
    // the chapter in the window between the two jobs.
    let read_since_fanout: HashSet<Uuid> = {
        use crate::schema::user_chapter_reads::dsl::*;
        user_chapter_reads
            .filter(series_id.eq(payload.series_id))
            .filter(chapter_number.eq(payload.chapter_number))
            .filter(user_id.eq_any(&payload.user_ids))
            .select(user_id)
            .load::<Uuid>(&*conn)?
            .into_iter()
            .collect()
    };

    let metadata = serde_json::json!({
        "chapter_number": payload.chapter_number,
        "source_name": payload.source_name,
    });
    let rows: Vec<NewNotification> = payload
        .user_ids
        .iter()
        .filter(|user| !read_since_fanout.contains(user))
        .map(|user| NewNotification {
            user_id: *user,
            kind: NOTIFICATION_NEW_CHAPTER.into(),
            series_id: payload.series_id,
            logical_chapter_id: Some(logical_chapter),
            metadata: metadata.clone(),
        })
        .collect();

    if rows.is_empty() {
        info!("Every recipient already read the chapter.");
        return Ok(());
    }

    let inserted = diesel::insert_into(crate::schema::notifications::table)
        .values(&rows)
        .on_conflict(on_constraint("uq_notifications_chapter"))
        .do_nothing()
        .execute(&*conn)?;

    info!(
        candidates = rows.len(),
        inserted, "Delivered chapter notifications."
    );
    ctx.analytics
        .record(Event::NotificationsInserted { count: inserted });
    Ok(())
}
