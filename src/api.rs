use std::convert::Infallible;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{reply, Filter, Rejection, Reply};

use crate::context::AppCtx;
use crate::error::{Error, ErrorKind};
use crate::library;
use crate::models::Series;
use crate::on_demand;
use crate::search::{self, SearchFilters, SearchRequest};
use crate::workers::canonicalize;
use crate::workers::CanonicalizePayload;
use crate::{ingest, kv::heartbeat, queue, rate_limit::DEFAULT_MAX_WAIT, scrapers};

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    filters: SearchFilters,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    is_premium: bool,
}

#[derive(Debug, Deserialize)]
struct CreateSeriesBody {
    url: String,
}

#[derive(Debug, Deserialize)]
struct LibraryBody {
    user_id: Uuid,
}

pub fn routes(ctx: AppCtx) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let search_ctx = ctx.clone();
    let search_filter = warp::post()
        .and(warp::path("search"))
        .and(warp::path::end())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::any().map(move || search_ctx.clone()))
        .and(warp::body::json())
        .and(warp::addr::remote())
        .then(run_search)
        .map(map_result);

    let create_ctx = ctx.clone();
    let create_series_filter = warp::post()
        .and(warp::path("series"))
        .and(warp::path::end())
        .and(warp::body::content_length_limit(1024))
        .and(warp::any().map(move || create_ctx.clone()))
        .and(warp::body::json())
        .then(create_series)
        .map(map_result);

    let sync_ctx = ctx.clone();
    let sync_filter = warp::post()
        .and(warp::path("series"))
        .and(warp::path::param::<Uuid>())
        .and(warp::path("sync"))
        .and(warp::path::end())
        .and(warp::any().map(move || sync_ctx.clone()))
        .then(|series_id, ctx: AppCtx| async move { on_demand::sync_now(&ctx, series_id).await })
        .map(map_result);

    let follow_ctx = ctx.clone();
    let follow_filter = warp::put()
        .and(warp::path("library"))
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::body::content_length_limit(1024))
        .and(warp::any().map(move || follow_ctx.clone()))
        .and(warp::body::json())
        .then(
            |series_id, ctx: AppCtx, body: LibraryBody| async move {
                library::follow(&ctx.db, body.user_id, series_id).await
            },
        )
        .map(map_result);

    let unfollow_ctx = ctx.clone();
    let unfollow_filter = warp::delete()
        .and(warp::path("library"))
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::body::content_length_limit(1024))
        .and(warp::any().map(move || unfollow_ctx.clone()))
        .and(warp::body::json())
        .then(
            |series_id, ctx: AppCtx, body: LibraryBody| async move {
                library::unfollow(&ctx.db, body.user_id, series_id).await
            },
        )
        .map(map_result);

    let health_ctx = ctx;
    let health_filter = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::any().map(move || health_ctx.clone()))
        .and_then(health);

    search_filter
        .or(create_series_filter)
        .or(sync_filter)
        .or(follow_filter)
        .or(unfollow_filter)
        .or(health_filter)
}

async fn run_search(
    ctx: AppCtx,
    body: SearchBody,
    addr: Option<SocketAddr>,
) -> Result<search::SearchResponse, Error> {
    let request = SearchRequest {
        user_id: body.user_id,
        is_premium: body.is_premium,
        ip: addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".into()),
        query: body.query,
        filters: body.filters,
        cursor: body.cursor,
    };
    search::dispatch(&ctx, request).await
}

/// Bind a pasted source URL: scrape its metadata, canonicalize it into a
/// series + binding, and backfill the chapter catalog.
#[tracing::instrument(name = "Creating a series from a url.", err, level = "info", skip(ctx, body))]
async fn create_series(ctx: AppCtx, body: CreateSeriesBody) -> Result<Series, Error> {
    let url = crate::safe_url::validate(&body.url)?;
    let (scraper, source_id) = ctx
        .scrapers
        .for_url(&url)
        .ok_or_else(|| Error::InvalidInput("url does not belong to a known source".into()))?;

    if !ctx
        .rate_limiter
        .acquire(scraper.name(), DEFAULT_MAX_WAIT)
        .await?
    {
        return Err(Error::RateLimited {
            source_name: scraper.name().to_string(),
            wait_ms: DEFAULT_MAX_WAIT.as_millis() as u64,
        });
    }
    let scraped = scrapers::scrape_series_guarded(&ctx.kv, scraper.as_ref(), &source_id).await?;

    canonicalize::run(
        &ctx,
        CanonicalizePayload {
            source_name: scraper.name().to_string(),
            source_id: source_id.clone(),
            title: scraped.title.clone(),
            alt_titles: scraped.alt_titles.clone(),
            cover_url: scraped.cover_url.clone(),
            content_rating: scraped.content_rating.clone(),
        },
    )
    .await?;

    let (series, _) = load_bound_series(&ctx, scraper.name(), &source_id).await?;
    let chapters: Vec<ingest::IncomingChapter> =
        scraped.chapters.into_iter().map(Into::into).collect();
    ingest::sync_chapters(&ctx.db, series.id, scraper.name(), &source_id, &chapters).await?;

    let (series, _) = load_bound_series(&ctx, scraper.name(), &source_id).await?;
    Ok(series)
}

async fn load_bound_series(
    ctx: &AppCtx,
    source: &str,
    provider_local_id: &str,
) -> Result<(Series, Uuid), Error> {
    use diesel::{ExpressionMethods, QueryDsl, RunQueryDsl};
    let conn = ctx.db.conn().await?;
    let (bound_series, binding): (Uuid, Uuid) = {
        use crate::schema::series_sources::dsl::*;
        series_sources
            .filter(source_name.eq(source))
            .filter(source_id.eq(provider_local_id))
            .select((series_id, id))
            .first(&*conn)?
    };
    let series: Series = {
        use crate::schema::series::dsl::*;
        series.filter(id.eq(bound_series)).first(&*conn)?
    };
    Ok((series, binding))
}

async fn health(ctx: AppCtx) -> Result<impl Reply, Infallible> {
    let workers = heartbeat::workers_online(&ctx.kv).await.unwrap_or(false);
    let mut queues = serde_json::Map::new();
    for name in queue::ALL_QUEUES {
        let counts = ctx.queues.counts(name).await.unwrap_or_default();
        queues.insert(
            name.to_string(),
            serde_json::json!({"waiting": counts.waiting, "delayed": counts.delayed}),
        );
    }
    let status = if workers {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(reply::with_status(
        reply::json(&serde_json::json!({
            "workers_online": workers,
            "queues": queues,
        })),
        status,
    ))
}

fn map_result(result: Result<impl Serialize, Error>) -> impl Reply {
    match result {
        Ok(x) => reply::with_status(reply::json(&x), StatusCode::OK),
        Err(err) => {
            let (status, body) = match err.kind() {
                ErrorKind::InvalidInput => (
                    StatusCode::BAD_REQUEST,
                    ErrorMessage {
                        message: err.to_string(),
                    },
                ),
                ErrorKind::NotFound => (
                    StatusCode::NOT_FOUND,
                    ErrorMessage {
                        message: err.to_string(),
                    },
                ),
                ErrorKind::Unauthorized => (
                    StatusCode::UNAUTHORIZED,
                    ErrorMessage {
                        message: String::from("Not authorized."),
                    },
                ),
                ErrorKind::Conflict => (
                    StatusCode::CONFLICT,
                    ErrorMessage {
                        message: String::from("A conflicting request is already running."),
                    },
                ),
                ErrorKind::RateLimited | ErrorKind::CircuitOpen => (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorMessage {
                        message: String::from("The source is busy; try again shortly."),
                    },
                ),
                ErrorKind::TransientDb | ErrorKind::Timeout => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorMessage {
                        message: String::from("Temporarily unavailable; try again shortly."),
                    },
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorMessage {
                        message: String::from("An internal exception occurred."),
                    },
                ),
            };
            error!(
                "Returning error body: {}, StatusCode: {}, Source: {:?}",
                serde_json::to_string(&body).expect("Failed to serialize outgoing message body."),
                status,
                err
            );
            reply::with_status(reply::json(&body), status)
        }
    }
}
