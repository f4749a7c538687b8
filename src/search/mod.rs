pub mod deferred;
pub mod heat;
pub mod intent;

use std::time::Duration;

use chrono::Utc;
use diesel::{sql_types, RunQueryDsl};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::Event;
use crate::context::AppCtx;
use crate::error::{ErrorKind, Result};
use crate::kv::heartbeat;
use crate::models::Series;
use crate::queue::{self, JobOptions, JobPriority};
use crate::workers::{job_ids, CheckSourcePayload, TRIGGER_SEARCH};

use self::deferred::DeferredSearch;
use self::intent::Intent;

/// Fewer local rows than this invites external enrichment.
pub const LOCAL_RESULT_TARGET: usize = 5;
pub const PREMIUM_DAILY_BYPASS_QUOTA: i64 = 50;
pub const PREMIUM_CONCURRENCY_CAP: i64 = 2;
/// External discovery dispatches against this catalog.
pub const DISCOVERY_SOURCE: &str = "mangadex";

const LOCAL_QUERY_LIMIT: i64 = 20;
const PENDING_TTL_SECS: usize = 10;
const PENDING_WAIT: Duration = Duration::from_secs(3);
const PENDING_POLL: Duration = Duration::from_millis(250);
const COOLDOWN_SECS: usize = 30;
const CACHE_TTL_FULL_SECS: u64 = 3600;
const CACHE_TTL_SPARSE_SECS: u64 = 300;
const CONCURRENCY_KEY_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub series_type: Option<String>,
    #[serde(default)]
    pub content_rating: Option<String>,
}

impl SearchFilters {
    /// Stable representation for fingerprinting.
    fn repr(&self) -> String {
        format!(
            "type={};rating={}",
            self.series_type.as_deref().unwrap_or(""),
            self.content_rating.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub user_id: Option<Uuid>,
    pub is_premium: bool,
    pub ip: String,
    pub query: String,
    pub filters: SearchFilters,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesHit {
    pub id: Uuid,
    pub title: String,
    pub cover_url: Option<String>,
    pub latest_chapter: Option<f64>,
    pub content_rating: String,
    pub total_follows: i64,
}

impl From<Series> for SeriesHit {
    fn from(s: Series) -> SeriesHit {
        SeriesHit {
            id: s.id,
            title: s.title,
            cover_url: s.best_cover_url,
            latest_chapter: s.latest_chapter,
            content_rating: s.content_rating.as_str().to_string(),
            total_follows: s.total_follows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Local data answered the query.
    Complete,
    /// An external resolution is in flight; poll again shortly.
    Resolving,
    /// External resolution was postponed; the scheduler will retry it.
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub status: SearchStatus,
    pub results: Vec<SeriesHit>,
    #[serde(rename = "_warning", skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Resolve a user search. Always answers from local data; the question the
/// gates decide is whether to also spend an external catalog call.
#[tracing::instrument(
    name = "Dispatching a search.",
    err,
    level = "info",
    skip(ctx, request),
    fields(premium = request.is_premium)
)]
pub async fn dispatch(ctx: &AppCtx, request: SearchRequest) -> Result<SearchResponse> {
    let normalized = intent::normalize_query(&request.query);
    let fingerprint = intent::fingerprint(&normalized, &request.filters.repr());
    let cache_key = ctx.kv.key(&format!("search:cache:{}", fingerprint));
    let pending_key = ctx.kv.key(&format!("search:pending:{}", fingerprint));

    if let Some(results) = cache_get(ctx, &cache_key).await? {
        ctx.analytics.record(Event::SearchCacheHit);
        return Ok(SearchResponse {
            status: SearchStatus::Complete,
            results,
            warning: None,
        });
    }

    // One resolver per fingerprint: losers wait briefly for the winner's
    // cache entry instead of re-running the query.
    if !claim_pending(ctx, &pending_key).await? {
        if let Some(results) = await_pending_result(ctx, &cache_key).await? {
            ctx.analytics.record(Event::SearchCoalesced);
            return Ok(SearchResponse {
                status: SearchStatus::Complete,
                results,
                warning: None,
            });
        }
        return Ok(SearchResponse {
            status: SearchStatus::Resolving,
            results: Vec::new(),
            warning: None,
        });
    }

    let (results, warning) = match local_query(ctx, &normalized, &request.filters).await {
        Ok(rows) => (rows, None),
        Err(err) if err.kind() == ErrorKind::TransientDb => {
            warn!(?err, "Local search degraded by a transient database error.");
            (
                Vec::new(),
                Some("search results may be incomplete".to_string()),
            )
        }
        Err(err) => {
            release_pending(ctx, &pending_key).await;
            return Err(err);
        }
    };

    if warning.is_none() {
        cache_put(ctx, &cache_key, &results).await?;
    }
    release_pending(ctx, &pending_key).await;

    if !wants_external(&normalized, request.cursor.is_some(), results.len()) {
        ctx.analytics.record(Event::SearchLocalOnly);
        return Ok(SearchResponse {
            status: SearchStatus::Complete,
            results,
            warning,
        });
    }

    let status = external_gates(ctx, &request, &normalized, &results).await?;
    Ok(SearchResponse {
        status,
        results,
        warning,
    })
}

/// Steps 4-9: decide whether this query earns an external catalog call
/// right now, is parked for later, or is suppressed.
async fn external_gates(
    ctx: &AppCtx,
    request: &SearchRequest,
    normalized: &str,
    local_results: &[SeriesHit],
) -> Result<SearchStatus> {
    let detected = intent::detect(normalized);
    let effective_query = intent::strip_intent_verb(normalized);
    let hash = intent::query_hash(effective_query);

    if detected == Intent::Noise && has_substring_match(local_results, normalized) {
        return Ok(SearchStatus::Complete);
    }

    // Heat gate, unless the user's intent or tier buys past it.
    let bypass = detected.is_forced()
        || (request.is_premium && premium_quota_allows(ctx, request.user_id).await?);
    if !bypass {
        let user_repr = request.user_id.map(|u| u.to_string());
        let sample = heat::bump(&ctx.kv, &hash, user_repr.as_deref()).await?;
        if !heat::is_hot(sample) {
            return defer_search(
                ctx,
                &hash,
                effective_query,
                deferred::REASON_LOW_HEAT,
                request.is_premium,
            )
            .await;
        }
    }

    // System health gate.
    if !heartbeat::workers_online(&ctx.kv).await? {
        return defer_search(
            ctx,
            &hash,
            effective_query,
            deferred::REASON_WORKERS_OFFLINE,
            request.is_premium,
        )
        .await;
    }
    if !ctx.queues.is_healthy(queue::CHECK_SOURCE).await? {
        return defer_search(
            ctx,
            &hash,
            effective_query,
            deferred::REASON_QUEUE_UNHEALTHY,
            request.is_premium,
        )
        .await;
    }

    // Premium users cap at two in-flight catalog jobs.
    if request.is_premium {
        if let Some(user) = request.user_id {
            if !premium_concurrency_allows(ctx, user).await? {
                return defer_search(
                    ctx,
                    &hash,
                    effective_query,
                    deferred::REASON_CONCURRENCY_CAP,
                    request.is_premium,
                )
                .await;
            }
        }
    }

    // Per-IP cooldown suppresses repeat dispatch of the same query.
    if !cooldown_allows(ctx, &request.ip, &hash).await? {
        return Ok(SearchStatus::Resolving);
    }

    enqueue_external(ctx, effective_query, &hash, request.is_premium, detected).await?;
    ctx.analytics.record(Event::SearchEnqueued);
    Ok(SearchStatus::Resolving)
}

pub(crate) async fn enqueue_external(
    ctx: &AppCtx,
    query: &str,
    query_hash: &str,
    is_premium: bool,
    detected: Intent,
) -> Result<bool> {
    let payload = CheckSourcePayload {
        source_name: DISCOVERY_SOURCE.into(),
        trigger: TRIGGER_SEARCH.into(),
        query: Some(query.to_string()),
        series_id: None,
        series_source_id: None,
        source_id: None,
    };
    let priority = external_priority(is_premium, detected);
    let added = ctx
        .queues
        .add(
            queue::CHECK_SOURCE,
            serde_json::to_value(&payload).expect("payload serializes"),
            JobOptions::with_priority_value(job_ids::search(query_hash), priority),
        )
        .await?;
    info!(query_hash, priority, added, "External search dispatch.");
    Ok(added)
}

/// Premium rides the critical lane; anonymous keyword exploration sinks
/// below standard priority.
fn external_priority(is_premium: bool, detected: Intent) -> i32 {
    if is_premium {
        JobPriority::Critical.as_i32()
    } else if detected == Intent::Keyword {
        JobPriority::Standard.as_i32() + 5
    } else {
        JobPriority::Standard.as_i32()
    }
}

async fn defer_search(
    ctx: &AppCtx,
    hash: &str,
    query: &str,
    reason: &'static str,
    is_premium: bool,
) -> Result<SearchStatus> {
    let entry = DeferredSearch::new(query, reason, is_premium);
    deferred::defer(&ctx.kv, hash, &entry).await?;
    ctx.analytics.record(Event::SearchDeferred { reason });
    info!(query_hash = hash, reason, "Search deferred.");
    Ok(SearchStatus::Deferred)
}

/// External enrichment applies only to first-page keyword queries that
/// local data cannot satisfy.
fn wants_external(normalized: &str, has_cursor: bool, local_count: usize) -> bool {
    !normalized.is_empty() && !has_cursor && local_count < LOCAL_RESULT_TARGET
}

fn has_substring_match(results: &[SeriesHit], normalized: &str) -> bool {
    results
        .iter()
        .any(|hit| hit.title.to_lowercase().contains(normalized))
}

async fn cache_get(ctx: &AppCtx, cache_key: &str) -> Result<Option<Vec<SeriesHit>>> {
    let mut conn = ctx.kv.conn();
    let raw: Option<String> = conn.get(cache_key).await?;
    Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
}

async fn cache_put(ctx: &AppCtx, cache_key: &str, results: &[SeriesHit]) -> Result<()> {
    let ttl = if results.len() >= LOCAL_RESULT_TARGET {
        CACHE_TTL_FULL_SECS
    } else {
        CACHE_TTL_SPARSE_SECS
    };
    let mut conn = ctx.kv.conn();
    let _: () = conn
        .set_ex(
            cache_key,
            serde_json::to_string(results).expect("hits serialize"),
            ttl,
        )
        .await?;
    Ok(())
}

async fn claim_pending(ctx: &AppCtx, pending_key: &str) -> Result<bool> {
    let mut conn = ctx.kv.conn();
    let claimed: Option<String> = redis::cmd("SET")
        .arg(pending_key)
        .arg(Uuid::new_v4().to_string())
        .arg("NX")
        .arg("EX")
        .arg(PENDING_TTL_SECS)
        .query_async(&mut conn)
        .await?;
    Ok(claimed.is_some())
}

async fn release_pending(ctx: &AppCtx, pending_key: &str) {
    let mut conn = ctx.kv.conn();
    let released: Result<(), redis::RedisError> = conn.del(pending_key).await;
    if let Err(err) = released {
        warn!(?err, "Failed to release pending search slot; it expires on its own.");
    }
}

async fn await_pending_result(ctx: &AppCtx, cache_key: &str) -> Result<Option<Vec<SeriesHit>>> {
    let deadline = tokio::time::Instant::now() + PENDING_WAIT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(PENDING_POLL).await;
        if let Some(results) = cache_get(ctx, cache_key).await? {
            return Ok(Some(results));
        }
    }
    Ok(None)
}

/// Structured local catalog query against the read replica.
async fn local_query(
    ctx: &AppCtx,
    normalized: &str,
    filters: &SearchFilters,
) -> Result<Vec<SeriesHit>> {
    let conn = ctx.db_read.conn().await?;
    let pattern = format!("%{}%", normalized);
    let rows: Vec<Series> = diesel::sql_query(
        "SELECT * FROM series \
         WHERE (title ILIKE $1 \
                OR EXISTS (SELECT 1 FROM unnest(alt_titles) AS alt WHERE alt ILIKE $1)) \
           AND ($2::text IS NULL OR series_type = $2) \
           AND ($3::text IS NULL OR content_rating = $3) \
         ORDER BY total_follows DESC, title ASC \
         LIMIT $4",
    )
    .bind::<sql_types::Text, _>(&pattern)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&filters.series_type)
    .bind::<sql_types::Nullable<sql_types::Text>, _>(&filters.content_rating)
    .bind::<sql_types::BigInt, _>(LOCAL_QUERY_LIMIT)
    .load(&*conn)?;
    Ok(rows.into_iter().map(SeriesHit::from).collect())
}

/// True while the user still has daily bypass budget; each allowed call
/// consumes one unit.
async fn premium_quota_allows(ctx: &AppCtx, user_id: Option<Uuid>) -> Result<bool> {
    let user = match user_id {
        Some(u) => u,
        None => return Ok(false),
    };
    let day = Utc::now().format("%Y%m%d");
    let key = ctx.kv.key(&format!("premium:quota:{}:{}", user, day));
    let mut conn = ctx.kv.conn();
    let used: i64 = conn.incr(&key, 1).await?;
    let _: () = conn.expire(&key, 25 * 60 * 60).await?;
    Ok(used <= PREMIUM_DAILY_BYPASS_QUOTA)
}

async fn premium_concurrency_allows(ctx: &AppCtx, user: Uuid) -> Result<bool> {
    let key = ctx.kv.key(&format!("premium:concurrency:{}", user));
    let mut conn = ctx.kv.conn();
    let active: i64 = conn.incr(&key, 1).await?;
    let _: () = conn.expire(&key, CONCURRENCY_KEY_TTL_SECS).await?;
    if active > PREMIUM_CONCURRENCY_CAP {
        let _: i64 = conn.decr(&key, 1).await?;
        return Ok(false);
    }
    Ok(true)
}

async fn cooldown_allows(ctx: &AppCtx, ip: &str, query_hash: &str) -> Result<bool> {
    let key = ctx.kv.key(&format!("cooldown:search:{}:{}", ip, query_hash));
    let mut conn = ctx.kv.conn();
    let claimed: Option<String> = redis::cmd("SET")
        .arg(&key)
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(COOLDOWN_SECS)
        .query_async(&mut conn)
        .await?;
    Ok(claimed.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str) -> SeriesHit {
        SeriesHit {
            id: Uuid::new_v4(),
            title: title.to_string(),
            cover_url: None,
            latest_chapter: None,
            content_rating: "safe".into(),
            total_follows: 0,
        }
    }

    #[test]
    fn external_only_for_sparse_first_page_queries() {
        assert!(wants_external("solo leveling", false, 0));
        assert!(wants_external("solo leveling", false, 4));
        assert!(!wants_external("solo leveling", false, 5));
        assert!(!wants_external("solo leveling", true, 0));
        assert!(!wants_external("", false, 0));
    }

    #[test]
    fn substring_match_detection() {
        let results = vec![hit("Solo Leveling"), hit("Berserk")];
        assert!(has_substring_match(&results, "solo"));
        assert!(!has_substring_match(&results, "punpun"));
    }

    #[test]
    fn priority_by_tier_and_intent() {
        assert_eq!(external_priority(true, Intent::Keyword), 0);
        assert_eq!(external_priority(false, Intent::Keyword), 10);
        assert_eq!(external_priority(false, Intent::Follow), 5);
    }

    #[test]
    fn filter_repr_distinguishes_filters() {
        let unfiltered = SearchFilters::default();
        let filtered = SearchFilters {
            series_type: Some("manhwa".into()),
            content_rating: None,
        };
        assert_ne!(unfiltered.repr(), filtered.repr());
    }
}
