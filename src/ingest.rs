use chrono::{DateTime, Utc};
use diesel::connection::Connection;
use diesel::{
    sql_types, BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl,
    RunQueryDsl,
};
use diesel_tracing::pg::InstrumentedPgConnection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection_pool::DbPool;
use crate::error::{Error, Result};
use crate::models::{SeriesSource, SeriesSourceUpdate};

/// How many chapters go into one transaction. Bounded so a 2,000-chapter
/// backfill cannot hold row locks for the whole run.
const BATCH_SIZE: usize = 50;

/// One scraped chapter, normalized by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingChapter {
    pub chapter_number: f64,
    pub chapter_title: Option<String>,
    pub chapter_url: String,
    pub scanlation_group: Option<String>,
    pub language: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterUpsert {
    pub chapter_id: Uuid,
    /// True when the logical chapter row was created by this statement
    /// rather than updated. Replayed jobs see false and skip fan-out.
    pub newly_inserted: bool,
}

#[derive(QueryableByName)]
struct UpsertedChapterRow {
    #[sql_type = "sql_types::Uuid"]
    id: Uuid,
    #[sql_type = "sql_types::Bool"]
    inserted: bool,
}

#[derive(QueryableByName)]
struct CountRow {
    #[sql_type = "sql_types::BigInt"]
    count: i64,
}

/// Upsert the source-agnostic chapter row. Title and published time merge
/// null-safely: a source that omits them never erases what another source
/// already provided.
fn upsert_logical_chapter(
    conn: &InstrumentedPgConnection,
    series_id: Uuid,
    chapter: &IncomingChapter,
) -> Result<ChapterUpsert> {
    let row: UpsertedChapterRow = diesel::sql_query(
        "INSERT INTO logical_chapters \
             (series_id, chapter_number, chapter_title, published_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT ON CONSTRAINT uq_logical_chapters_series_number \
         DO UPDATE SET \
             chapter_title = COALESCE(EXCLUDED.chapter_title, logical_chapters.chapter_title), \
             published_at = COALESCE(EXCLUDED.published_at, logical_chapters.published_at) \
         RETURNING id, (xmax = 0) AS inserted",
    )
    .bind::<sql_types::Uuid, _>(series_id)
    .bind::<sql_types::Double, _>(chapter.chapter_number)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&chapter.chapter_title)
    .bind::<sql_types::Nullable<sql_types::Timestamptz>, _>(chapter.published_at)
    .get_result(conn)?;
    Ok(ChapterUpsert {
        chapter_id: row.id,
        newly_inserted: row.inserted,
    })
}

fn upsert_chapter_source(
    conn: &InstrumentedPgConnection,
    series_source_id: Uuid,
    chapter_id: Uuid,
    chapter: &IncomingChapter,
) -> Result<()> {
    diesel::sql_query(
        "INSERT INTO chapter_sources \
             (series_source_id, chapter_id, chapter_url, chapter_title, \
              scanlation_group, language, source_published_at, is_available) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE) \
         ON CONFLICT ON CONSTRAINT uq_chapter_sources_link \
         DO UPDATE SET \
             chapter_url = EXCLUDED.chapter_url, \
             chapter_title = COALESCE(EXCLUDED.chapter_title, chapter_sources.chapter_title), \
             source_published_at = COALESCE(EXCLUDED.source_published_at, chapter_sources.source_published_at), \
             is_available = TRUE",
    )
    .bind::<sql_types::Uuid, _>(series_source_id)
    .bind::<sql_types::Uuid, _>(chapter_id)
    .bind::<sql_types::Text, _>(&chapter.chapter_url)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&chapter.chapter_title)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&chapter.scanlation_group)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&chapter.language)
    .bind::<sql_types::Nullable<sql_types::Timestamptz>, _>(chapter.published_at)
    .execute(conn)?;
    Ok(())
}

fn load_series_source(
    conn: &InstrumentedPgConnection,
    for_series: Uuid,
    source: &str,
    provider_local_id: &str,
) -> Result<SeriesSource> {
    use crate::schema::series_sources::dsl::*;
    let row: Option<SeriesSource> = series_sources
        .filter(source_name.eq(source))
        .filter(source_id.eq(provider_local_id))
        .first(conn)
        .optional()?;
    match row {
        Some(row) if row.series_id == for_series => Ok(row),
        Some(row) => Err(Error::NotFound(format!(
            "source binding {}/{} belongs to series {}, not {}",
            source, provider_local_id, row.series_id, for_series
        ))),
        None => Err(Error::NotFound(format!(
            "no source binding for {}/{}",
            source, provider_local_id
        ))),
    }
}

/// Upsert a scraped chapter list for one (series, source) pair.
///
/// Chapters are committed in batches; the source heartbeat columns and the
/// monotonic `latest_chapter` update land in a final transaction once every
/// batch has committed. Returns the number of chapters processed. Replays
/// are harmless: every statement is an upsert and `source_chapter_count` is
/// recomputed, never incremented.
#[tracing::instrument(
    name = "Syncing scraped chapters.",
    err,
    level = "info",
    skip(db, chapters),
    fields(chapter_count = chapters.len())
)]
pub async fn sync_chapters(
    db: &DbPool,
    series_id: Uuid,
    source_name: &str,
    source_id: &str,
    chapters: &[IncomingChapter],
) -> Result<usize> {
    if chapters.is_empty() {
        return Ok(0);
    }

    let conn = db.conn().await?;
    let source = load_series_source(&conn, series_id, source_name, source_id)?;

    let mut inserted_new = 0usize;
    for batch in chapters.chunks(BATCH_SIZE) {
        let new_in_batch = conn.transaction::<usize, Error, _>(|| {
            diesel::sql_query("SET LOCAL statement_timeout = 30000").execute(&*conn)?;
            let mut fresh = 0;
            for chapter in batch {
                let upserted = upsert_logical_chapter(&conn, series_id, chapter)?;
                if upserted.newly_inserted {
                    fresh += 1;
                }
                upsert_chapter_source(&conn, source.id, upserted.chapter_id, chapter)?;
            }
            Ok(fresh)
        })?;
        inserted_new += new_in_batch;
    }

    let observed_max = chapters
        .iter()
        .map(|c| c.chapter_number)
        .fold(f64::NEG_INFINITY, f64::max);

    conn.transaction::<_, Error, _>(|| {
        let count: CountRow = diesel::sql_query(
            "SELECT COUNT(*) AS count FROM chapter_sources WHERE series_source_id = $1",
        )
        .bind::<sql_types::Uuid, _>(source.id)
        .get_result(&*conn)?;

        {
            use crate::schema::series_sources::dsl::*;
            diesel::update(series_sources.filter(id.eq(source.id)))
                .set(&SeriesSourceUpdate {
                    last_success_at: Some(Utc::now()),
                    last_checked_at: Some(Utc::now()),
                    failure_count: Some(0),
                    source_chapter_count: Some(count.count as i32),
                    ..Default::default()
                })
                .execute(&*conn)?;
        }
        {
            use crate::schema::series::dsl::*;
            diesel::update(
                series
                    .filter(id.eq(series_id))
                    .filter(latest_chapter.lt(observed_max).or(latest_chapter.is_null())),
            )
            .set(latest_chapter.eq(observed_max))
            .execute(&*conn)?;
        }
        Ok(())
    })?;

    info!(
        %series_id,
        source = source_name,
        processed = chapters.len(),
        new = inserted_new,
        "Synced chapter catalog."
    );

    // Outside the transactions on purpose: a cover hiccup must not undo an
    // otherwise successful sync.
    if let Err(err) = refresh_best_cover(db, series_id).await {
        warn!(%series_id, ?err, "Failed to refresh best cover after sync.");
    }

    Ok(chapters.len())
}

/// Single-chapter variant used by the chapter-ingest worker. Reports
/// whether the logical chapter was newly created so the caller can decide
/// on notification fan-out.
pub async fn ingest_single_chapter(
    db: &DbPool,
    series_id: Uuid,
    series_source_id: Uuid,
    chapter: &IncomingChapter,
) -> Result<ChapterUpsert> {
    let conn = db.conn().await?;
    let upserted = conn.transaction::<ChapterUpsert, Error, _>(|| {
        diesel::sql_query("SET LOCAL statement_timeout = 30000").execute(&*conn)?;
        let upserted = upsert_logical_chapter(&conn, series_id, chapter)?;
        upsert_chapter_source(&conn, series_source_id, upserted.chapter_id, chapter)?;
        Ok(upserted)
    })?;
    Ok(upserted)
}

/// Touch the binding's health columns after a scrape that produced no new
/// bulk sync (the incremental path still proves the source is alive).
pub async fn mark_source_checked(db: &DbPool, binding: Uuid, observed_chapters: usize) -> Result<()> {
    use crate::schema::series_sources::dsl::*;
    let conn = db.conn().await?;
    diesel::update(series_sources.filter(id.eq(binding)))
        .set(&SeriesSourceUpdate {
            last_success_at: Some(Utc::now()),
            last_checked_at: Some(Utc::now()),
            failure_count: Some(0),
            source_chapter_count: Some(observed_chapters as i32),
            ..Default::default()
        })
        .execute(&*conn)?;
    Ok(())
}

/// Record a failed check; the failure count feeds priority maintenance.
pub async fn mark_source_failure(db: &DbPool, binding: Uuid) -> Result<()> {
    use crate::schema::series_sources::dsl::*;
    let conn = db.conn().await?;
    diesel::update(series_sources.filter(id.eq(binding)))
        .set((
            last_checked_at.eq(Utc::now()),
            failure_count.eq(failure_count + 1),
        ))
        .execute(&*conn)?;
    Ok(())
}

/// Recompute `best_cover_url` from the highest-trust binding that has one.
pub async fn refresh_best_cover(db: &DbPool, for_series: Uuid) -> Result<()> {
    let conn = db.conn().await?;
    let best: Option<Option<String>> = {
        use crate::schema::series_sources::dsl::*;
        series_sources
            .filter(series_id.eq(for_series))
            .filter(cover_url.is_not_null())
            .order_by(trust_score.desc())
            .select(cover_url)
            .first(&*conn)
            .optional()?
    };
    if let Some(Some(url)) = best {
        use crate::schema::series::dsl::*;
        diesel::update(series.filter(id.eq(for_series)))
            .set(best_cover_url.eq(url))
            .execute(&*conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(n: f64) -> IncomingChapter {
        IncomingChapter {
            chapter_number: n,
            chapter_title: None,
            chapter_url: format!("https://mangapark.io/title/1/{}", n),
            scanlation_group: None,
            language: Some("en".into()),
            published_at: None,
        }
    }

    #[test]
    fn batches_are_bounded() {
        let chapters: Vec<IncomingChapter> = (0..120).map(|n| chapter(n as f64)).collect();
        let batches: Vec<_> = chapters.chunks(BATCH_SIZE).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 50);
        assert_eq!(batches[2].len(), 20);
    }

    #[test]
    fn observed_max_ignores_order() {
        let chapters = vec![chapter(5.0), chapter(11.0), chapter(10.0)];
        let max = chapters
            .iter()
            .map(|c| c.chapter_number)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max, 11.0);
    }
}
