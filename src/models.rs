use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::IsVariant;
use diesel::{
    sql_types,
    types::{FromSql, ToSql},
    Identifiable, Queryable,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{
    chapter_sources, library_entries, logical_chapters, notifications, series, series_sources,
    users,
};

pub const NOTIFICATION_NEW_CHAPTER: &str = "NEW_CHAPTER";

macro_rules! text_backed_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} value {:?}",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl<DB> ToSql<sql_types::Text, DB> for $name
        where
            DB: diesel::backend::Backend,
            str: ToSql<sql_types::Text, DB>,
        {
            fn to_sql<W: std::io::Write>(
                &self,
                out: &mut diesel::serialize::Output<W, DB>,
            ) -> diesel::serialize::Result {
                self.as_str().to_sql(out)
            }
        }

        impl<DB> FromSql<sql_types::Text, DB> for $name
        where
            DB: diesel::backend::Backend,
            String: FromSql<sql_types::Text, DB>,
        {
            fn from_sql(bytes: Option<&DB::RawValue>) -> diesel::deserialize::Result<Self> {
                let s = String::from_sql(bytes)?;
                s.parse::<$name>().map_err(Into::into)
            }
        }
    };
}

/// Sync tiers. Hotter tiers are refreshed more often and enqueued sooner.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
    IsVariant,
)]
#[sql_type = "sql_types::Text"]
pub enum SyncPriority {
    Hot,
    Warm,
    Cold,
}

text_backed_enum!(SyncPriority {
    Hot => "HOT",
    Warm => "WARM",
    Cold => "COLD",
});

impl SyncPriority {
    /// How long a source in this tier may go between checks.
    pub const fn interval(&self) -> Duration {
        match self {
            SyncPriority::Hot => Duration::from_secs(15 * 60),
            SyncPriority::Warm => Duration::from_secs(4 * 60 * 60),
            SyncPriority::Cold => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Queue priority for sync jobs in this tier (lower runs sooner).
    pub const fn queue_priority(&self) -> i32 {
        match self {
            SyncPriority::Hot => 1,
            SyncPriority::Warm => 2,
            SyncPriority::Cold => 3,
        }
    }
}

/// Content ratings ordered from tamest to most restricted; a user cap of
/// `Suggestive` admits `Safe` and `Suggestive` series only.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
)]
#[sql_type = "sql_types::Text"]
pub enum ContentRating {
    Safe,
    Suggestive,
    Erotica,
    Pornographic,
}

text_backed_enum!(ContentRating {
    Safe => "safe",
    Suggestive => "suggestive",
    Erotica => "erotica",
    Pornographic => "pornographic",
});

impl ContentRating {
    /// Ratings a user capped at `self` may be notified about.
    pub fn allowed(&self) -> Vec<ContentRating> {
        [
            ContentRating::Safe,
            ContentRating::Suggestive,
            ContentRating::Erotica,
            ContentRating::Pornographic,
        ]
        .iter()
        .copied()
        .filter(|r| r <= self)
        .collect()
    }
}

#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
    IsVariant,
)]
#[sql_type = "sql_types::Text"]
pub enum LibraryStatus {
    Reading,
    Completed,
    Planning,
    Dropped,
    Paused,
}

text_backed_enum!(LibraryStatus {
    Reading => "reading",
    Completed => "completed",
    Planning => "planning",
    Dropped => "dropped",
    Paused => "paused",
});

#[derive(Identifiable, Queryable, QueryableByName, PartialEq, Debug, Serialize, Clone)]
#[table_name = "series"]
pub struct Series {
    pub id: Uuid,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub series_type: String,
    pub content_rating: ContentRating,
    pub latest_chapter: Option<f64>,
    pub total_follows: i64,
    pub best_cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[table_name = "series"]
pub struct NewSeries {
    pub title: String,
    pub alt_titles: Vec<String>,
    pub series_type: String,
    pub content_rating: ContentRating,
}

#[derive(Identifiable, Queryable, QueryableByName, Associations, PartialEq, Debug, Serialize, Clone)]
#[belongs_to(Series)]
#[table_name = "series_sources"]
pub struct SeriesSource {
    pub id: Uuid,
    pub series_id: Uuid,
    pub source_name: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
    pub trust_score: i32,
    pub sync_priority: SyncPriority,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub failure_count: i32,
    pub source_chapter_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[table_name = "series_sources"]
pub struct NewSeriesSource {
    pub series_id: Uuid,
    pub source_name: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
    pub trust_score: i32,
    pub sync_priority: SyncPriority,
}

/// Partial update for a source binding. `None` means "leave the column
/// alone", which is what lets sync paths avoid clobbering fields they did
/// not observe.
#[derive(AsChangeset, Debug, Default)]
#[table_name = "series_sources"]
pub struct SeriesSourceUpdate {
    pub source_url: Option<String>,
    pub cover_url: Option<String>,
    pub trust_score: Option<i32>,
    pub sync_priority: Option<SyncPriority>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub failure_count: Option<i32>,
    pub source_chapter_count: Option<i32>,
}

#[derive(Identifiable, Queryable, Associations, PartialEq, Debug, Serialize, Clone)]
#[belongs_to(Series)]
#[table_name = "logical_chapters"]
pub struct LogicalChapter {
    pub id: Uuid,
    pub series_id: Uuid,
    pub chapter_number: f64,
    pub chapter_title: Option<String>,
    pub volume_number: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Identifiable, Queryable, Associations, PartialEq, Debug, Clone)]
#[belongs_to(SeriesSource)]
#[belongs_to(LogicalChapter, foreign_key = "chapter_id")]
#[table_name = "chapter_sources"]
pub struct ChapterSource {
    pub id: Uuid,
    pub series_source_id: Uuid,
    pub chapter_id: Uuid,
    pub chapter_url: String,
    pub chapter_title: Option<String>,
    pub scanlation_group: Option<String>,
    pub language: Option<String>,
    pub source_published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub is_available: bool,
}

#[derive(Identifiable, Queryable, PartialEq, Debug, Clone)]
#[table_name = "users"]
pub struct User {
    pub id: Uuid,
    pub is_premium: bool,
    pub content_rating_cap: ContentRating,
    pub created_at: DateTime<Utc>,
}

#[derive(Identifiable, Queryable, Associations, PartialEq, Debug, Serialize, Clone)]
#[belongs_to(Series)]
#[primary_key(user_id, series_id)]
#[table_name = "library_entries"]
pub struct LibraryEntry {
    pub user_id: Uuid,
    pub series_id: Uuid,
    pub status: LibraryStatus,
    pub notify_new_chapters: bool,
    pub preferred_source: Option<String>,
    pub last_read_chapter: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[table_name = "library_entries"]
pub struct NewLibraryEntry {
    pub user_id: Uuid,
    pub series_id: Uuid,
    pub status: LibraryStatus,
    pub notify_new_chapters: bool,
}

#[derive(Queryable, PartialEq, Debug, Clone)]
pub struct UserChapterRead {
    pub user_id: Uuid,
    pub series_id: Uuid,
    pub chapter_number: f64,
    pub read_at: DateTime<Utc>,
}

#[derive(Identifiable, Queryable, PartialEq, Debug, Serialize, Clone)]
#[table_name = "notifications"]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub series_id: Uuid,
    pub logical_chapter_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[table_name = "notifications"]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: String,
    pub series_id: Uuid,
    pub logical_chapter_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trips_through_text() {
        for p in [SyncPriority::Hot, SyncPriority::Warm, SyncPriority::Cold] {
            assert_eq!(p.as_str().parse::<SyncPriority>().unwrap(), p);
        }
        assert!("LUKEWARM".parse::<SyncPriority>().is_err());
    }

    #[test]
    fn priority_intervals() {
        assert_eq!(SyncPriority::Hot.interval(), Duration::from_secs(900));
        assert_eq!(SyncPriority::Warm.interval(), Duration::from_secs(14_400));
        assert_eq!(SyncPriority::Cold.interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn content_rating_cap_is_ordered() {
        assert!(ContentRating::Safe < ContentRating::Pornographic);
        let allowed = ContentRating::Suggestive.allowed();
        assert_eq!(allowed, vec![ContentRating::Safe, ContentRating::Suggestive]);
        assert_eq!(ContentRating::Pornographic.allowed().len(), 4);
    }

    #[test]
    fn library_status_round_trips() {
        for s in [
            LibraryStatus::Reading,
            LibraryStatus::Completed,
            LibraryStatus::Planning,
            LibraryStatus::Dropped,
            LibraryStatus::Paused,
        ] {
            assert_eq!(s.as_str().parse::<LibraryStatus>().unwrap(), s);
        }
    }
}
