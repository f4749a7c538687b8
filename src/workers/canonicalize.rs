use diesel::connection::Connection;
use diesel::{sql_types, ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl};
use tracing::info;

use crate::context::AppCtx;
use crate::error::{Error, Result};
use crate::models::{ContentRating, NewSeries, NewSeriesSource, Series, SyncPriority};
use crate::queue::{self, JobOptions, JobPriority};

use super::{job_ids, CanonicalizePayload, CheckSourcePayload, TRIGGER_SEARCH};

/// Match an external catalog hit against local series; bind it, creating
/// the series when nothing matches. Replays converge on the same binding
/// thanks to the provider uniqueness constraint.
#[tracing::instrument(
    name = "Canonicalizing a catalog hit.",
    err,
    level = "info",
    skip(ctx, payload),
    fields(source = %payload.source_name, source_id = %payload.source_id)
)]
pub async fn run(ctx: &AppCtx, payload: CanonicalizePayload) -> Result<()> {
    if payload.title.trim().is_empty() {
        return Err(Error::InvalidInput(
            "catalog hit has no title to match on".into(),
        ));
    }

    let conn = ctx.db.conn().await?;

    // Already bound: idempotent replay or a second searcher racing us.
    let existing: Option<uuid::Uuid> = {
        use crate::schema::series_sources::dsl::*;
        series_sources
            .filter(source_name.eq(&payload.source_name))
            .filter(source_id.eq(&payload.source_id))
            .select(series_id)
            .first(&*conn)
            .optional()?
    };
    if existing.is_some() {
        return Ok(());
    }

    let matched = match_series(&conn, &payload.title, &payload.alt_titles)?;
    let (bound_series, created) = match matched {
        Some(series) => (series.id, false),
        None => {
            let series: Series = diesel::insert_into(crate::schema::series::table)
                .values(&NewSeries {
                    title: payload.title.clone(),
                    alt_titles: payload.alt_titles.clone(),
                    series_type: "manga".into(),
                    content_rating: payload
                        .content_rating
                        .as_deref()
                        .and_then(|r| r.parse().ok())
                        .unwrap_or(ContentRating::Safe),
                })
                .get_result(&*conn)?;
            (series.id, true)
        }
    };

    let inserted = conn.transaction::<usize, Error, _>(|| {
        let inserted = diesel::insert_into(crate::schema::series_sources::table)
            .values(&NewSeriesSource {
                series_id: bound_series,
                source_name: payload.source_name.clone(),
                source_id: payload.source_id.clone(),
                source_url: None,
                cover_url: payload.cover_url.clone(),
                trust_score: 5,
                sync_priority: SyncPriority::Cold,
            })
            .on_conflict_do_nothing()
            .execute(&*conn)?;
        Ok(inserted)
    })?;

    info!(
        series = %bound_series,
        created_series = created,
        bound = inserted == 1,
        "Canonicalized catalog hit."
    );

    // A fresh binding has no catalog yet; schedule its first sync.
    if inserted == 1 {
        let binding: uuid::Uuid = {
            use crate::schema::series_sources::dsl::*;
            series_sources
                .filter(source_name.eq(&payload.source_name))
                .filter(source_id.eq(&payload.source_id))
                .select(id)
                .first(&*conn)?
        };
        let sync = CheckSourcePayload {
            source_name: payload.source_name.clone(),
            trigger: TRIGGER_SEARCH.into(),
            query: None,
            series_id: Some(bound_series),
            series_source_id: Some(binding),
            source_id: Some(payload.source_id.clone()),
        };
        ctx.queues
            .add(
                queue::SYNC_SOURCE,
                serde_json::to_value(&sync).expect("payload serializes"),
                JobOptions::new(job_ids::sync(binding), JobPriority::Standard),
            )
            .await?;
    }

    Ok(())
}

#[derive(QueryableByName)]
struct MatchedSeries {
    #[sql_type = "sql_types::Uuid"]
    id: uuid::Uuid,
}

/// Title matching, tightest first: exact title, then exact alt-title, then
/// the hit's own alt titles against ours.
fn match_series(
    conn: &diesel_tracing::pg::InstrumentedPgConnection,
    title: &str,
    alt_titles: &[String],
) -> Result<Option<Series>> {
    let direct: Option<MatchedSeries> = diesel::sql_query(
        "SELECT id FROM series \
         WHERE lower(title) = lower($1) \
            OR EXISTS (SELECT 1 FROM unnest(alt_titles) AS alt WHERE lower(alt) = lower($1)) \
         LIMIT 1",
    )
    .bind::<sql_types::Text, _>(title)
    .get_result(conn)
    .optional()?;

    let matched_id = match direct {
        Some(m) => Some(m.id),
        None => {
            let mut found = None;
            for alt in alt_titles {
                let hit: Option<MatchedSeries> = diesel::sql_query(
                    "SELECT id FROM series WHERE lower(title) = lower($1) LIMIT 1",
                )
                .bind::<sql_types::Text, _>(alt)
                .get_result(conn)
                .optional()?;
                if let Some(hit) = hit {
                    found = Some(hit.id);
                    break;
                }
            }
            found
        }
    };

    match matched_id {
        Some(found) => {
            use crate::schema::series::dsl::*;
            Ok(Some(series.filter(id.eq(found)).first(conn)?))
        }
        None => Ok(None),
    }
}
