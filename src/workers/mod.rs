pub mod canonicalize;
pub mod chapter_ingest;
pub mod check_source;
pub mod cover_refresh;
pub mod notification_delivery;
pub mod notification_fanout;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::AppCtx;
use crate::error::{Error, Result};
use crate::queue::{self, Job};

/// What set a job in motion; recorded for tracing and for backfill
/// detection.
pub const TRIGGER_SCHEDULED: &str = "scheduled";
pub const TRIGGER_SEARCH: &str = "search";
pub const TRIGGER_ON_DEMAND: &str = "on-demand";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSourcePayload {
    pub source_name: String,
    pub trigger: String,
    /// Search mode: the user query to resolve against the catalog.
    #[serde(default)]
    pub query: Option<String>,
    /// Sync mode: the series and binding to refresh.
    #[serde(default)]
    pub series_id: Option<Uuid>,
    #[serde(default)]
    pub series_source_id: Option<Uuid>,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalizePayload {
    pub source_name: String,
    pub source_id: String,
    pub title: String,
    #[serde(default)]
    pub alt_titles: Vec<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub content_rating: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterIngestPayload {
    pub series_id: Uuid,
    pub series_source_id: Uuid,
    pub source_name: String,
    pub chapter_number: f64,
    #[serde(default)]
    pub chapter_title: Option<String>,
    pub chapter_url: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub scanlation_group: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationFanoutPayload {
    pub series_id: Uuid,
    pub series_source_id: Uuid,
    pub chapter_number: f64,
    pub source_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDeliveryPayload {
    pub series_id: Uuid,
    pub series_source_id: Uuid,
    pub chapter_number: f64,
    pub source_name: String,
    pub user_ids: Vec<Uuid>,
    pub is_premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverRefreshPayload {
    pub series_id: Uuid,
}

fn parse_payload<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        Error::InvalidInput(format!(
            "malformed {} payload for job {}: {}",
            job.queue, job.job_id, e
        ))
    })
}

/// Route a popped job to its processor. Every processor is idempotent
/// under replay; retry policy is applied by the caller based on the error
/// kind.
pub async fn process(ctx: &AppCtx, job: &Job) -> Result<()> {
    match job.queue.as_str() {
        queue::CHECK_SOURCE | queue::SYNC_SOURCE => {
            check_source::run(ctx, parse_payload(job)?).await
        }
        queue::CANONICALIZE => canonicalize::run(ctx, parse_payload(job)?).await,
        queue::CHAPTER_INGEST => chapter_ingest::run(ctx, parse_payload(job)?).await,
        queue::NOTIFICATION_FANOUT => notification_fanout::run(ctx, parse_payload(job)?).await,
        queue::NOTIFICATION_DELIVERY | queue::NOTIFICATION_DELIVERY_PREMIUM => {
            notification_delivery::run(ctx, parse_payload(job)?).await
        }
        queue::COVER_REFRESH => cover_refresh::run(ctx, parse_payload(job)?).await,
        other => Err(Error::InvalidInput(format!("unknown queue {:?}", other))),
    }
}

/// Deterministic ids let the queue suppress duplicate work at enqueue
/// time, which is what makes replays and horizontal scaling safe.
pub mod job_ids {
    use uuid::Uuid;

    pub fn sync(series_source_id: Uuid) -> String {
        format!("sync-{}", series_source_id)
    }

    pub fn canonicalize(source_name: &str, source_hit_id: &str) -> String {
        format!("canon_{}_{}", source_name, source_hit_id)
    }

    pub fn chapter_ingest(series_source_id: Uuid, chapter_number: f64) -> String {
        format!("ingest_{}_{}", series_source_id, chapter_number)
    }

    pub fn fanout(series_id: Uuid, chapter_number: f64) -> String {
        format!("fanout_{}_{}", series_id, chapter_number)
    }

    pub fn delivery(series_id: Uuid, chapter_number: f64, premium: bool, chunk: usize) -> String {
        format!(
            "deliver_{}_{}_{}_{}",
            series_id,
            chapter_number,
            if premium { "premium" } else { "free" },
            chunk
        )
    }

    pub fn cover_refresh(series_id: Uuid) -> String {
        format!("cover-{}", series_id)
    }

    pub fn search(query_hash: &str) -> String {
        format!("search_{}", query_hash)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_are_deterministic() {
            let series = Uuid::parse_str("b73cb137-24aa-4d17-bbc5-51c49e8a7b65").unwrap();
            assert_eq!(sync(series), sync(series));
            assert_eq!(
                canonicalize("mangadex", "abc"),
                "canon_mangadex_abc"
            );
            assert_eq!(fanout(series, 10.5), fanout(series, 10.5));
            assert_ne!(
                delivery(series, 10.5, true, 0),
                delivery(series, 10.5, false, 0)
            );
        }
    }
}
