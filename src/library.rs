use diesel::connection::Connection;
use diesel::{sql_types, ExpressionMethods, QueryDsl, RunQueryDsl};
use uuid::Uuid;

use crate::connection_pool::DbPool;
use crate::error::{Error, Result};
use crate::models::LibraryStatus;

/// Add a series to a user's library. Idempotent: re-following is a no-op
/// and `total_follows` moves only when a row is actually created.
#[tracing::instrument(name = "Following a series.", err, level = "info", skip(db))]
pub async fn follow(db: &DbPool, user_id: Uuid, series_id: Uuid) -> Result<bool> {
    let conn = db.conn().await?;
    conn.transaction::<bool, Error, _>(|| {
        let created = diesel::sql_query(
            "INSERT INTO library_entries (user_id, series_id, status, notify_new_chapters) \
             VALUES ($1, $2, 'reading', TRUE) \
             ON CONFLICT (user_id, series_id) DO NOTHING",
        )
        .bind::<sql_types::Uuid, _>(user_id)
        .bind::<sql_types::Uuid, _>(series_id)
        .execute(&*conn)?;

        if created == 1 {
            use crate::schema::series::dsl::*;
            diesel::update(series.filter(id.eq(series_id)))
                .set(total_follows.eq(total_follows + 1))
                .execute(&*conn)?;
        }
        Ok(created == 1)
    })
}

/// Remove a series from a user's library. `total_follows` decrements only
/// when a row was actually deleted, and never below zero.
#[tracing::instrument(name = "Unfollowing a series.", err, level = "info", skip(db))]
pub async fn unfollow(db: &DbPool, user_id: Uuid, series_id: Uuid) -> Result<bool> {
    let conn = db.conn().await?;
    conn.transaction::<bool, Error, _>(|| {
        let deleted = {
            use crate::schema::library_entries::dsl as le;
            diesel::delete(
                le::library_entries
                    .filter(le::user_id.eq(user_id))
                    .filter(le::series_id.eq(series_id)),
            )
            .execute(&*conn)?
        };

        if deleted == 1 {
            use crate::schema::series::dsl::*;
            diesel::update(series.filter(id.eq(series_id)))
                .set(total_follows.eq(diesel::dsl::sql::<sql_types::BigInt>(
                    "GREATEST(total_follows - 1, 0)",
                )))
                .execute(&*conn)?;
        }
        Ok(deleted == 1)
    })
}

/// Toggle new-chapter notifications for an existing entry.
pub async fn set_notifications(
    db: &DbPool,
    for_user: Uuid,
    for_series: Uuid,
    enabled: bool,
) -> Result<()> {
    use crate::schema::library_entries::dsl::*;
    let conn = db.conn().await?;
    let updated = diesel::update(
        library_entries
            .filter(user_id.eq(for_user))
            .filter(series_id.eq(for_series)),
    )
    .set(notify_new_chapters.eq(enabled))
    .execute(&*conn)?;
    if updated == 0 {
        return Err(Error::NotFound("library entry not found".into()));
    }
    Ok(())
}

pub async fn set_status(
    db: &DbPool,
    for_user: Uuid,
    for_series: Uuid,
    new_status: LibraryStatus,
) -> Result<()> {
    use crate::schema::library_entries::dsl::*;
    let conn = db.conn().await?;
    let updated = diesel::update(
        library_entries
            .filter(user_id.eq(for_user))
            .filter(series_id.eq(for_series)),
    )
    .set(status.eq(new_status))
    .execute(&*conn)?;
    if updated == 0 {
        return Err(Error::NotFound("library entry not found".into()));
    }
    Ok(())
}
