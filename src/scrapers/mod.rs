pub mod breaker;
pub mod comick;
pub mod mangadex;
pub mod mangapark;
pub mod mangasee;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{Error, ErrorKind, Result};
use crate::ingest::IncomingChapter;
use crate::kv::Kv;

/// A series as one provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedSeries {
    pub source_id: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub cover_url: Option<String>,
    pub content_rating: Option<String>,
    pub chapters: Vec<ScrapedChapter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedChapter {
    pub chapter_number: f64,
    pub chapter_title: Option<String>,
    pub chapter_url: String,
    pub scanlation_group: Option<String>,
    pub language: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<ScrapedChapter> for IncomingChapter {
    fn from(c: ScrapedChapter) -> Self {
        IncomingChapter {
            chapter_number: c.chapter_number,
            chapter_title: c.chapter_title,
            chapter_url: c.chapter_url,
            scanlation_group: c.scanlation_group,
            language: c.language,
            published_at: c.published_at,
        }
    }
}

/// A catalog search hit, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedSeriesSummary {
    pub source_id: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub cover_url: Option<String>,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Stable lowercase source name, also the rate-limit and breaker key.
    fn name(&self) -> &'static str;

    /// Cheap provider-format check for a provider-local id. Violations are
    /// `InvalidInput` and must be rejected before any outbound call.
    fn validate_source_id(&self, source_id: &str) -> Result<()>;

    /// Resolve a user-pasted URL to a provider-local id when this adapter
    /// owns the host.
    fn source_id_from_url(&self, url: &Url) -> Option<String>;

    /// Fetch series metadata plus its chapter catalog.
    async fn scrape_series(&self, source_id: &str) -> Result<ScrapedSeries>;

    /// Query the provider's catalog.
    async fn search(&self, query: &str) -> Result<Vec<ScrapedSeriesSummary>>;
}

/// All configured adapters, keyed by name.
#[derive(Clone)]
pub struct ScraperRegistry {
    scrapers: Vec<Arc<dyn Scraper>>,
}

impl ScraperRegistry {
    pub fn with_default_sources() -> ScraperRegistry {
        ScraperRegistry {
            scrapers: vec![
                Arc::new(mangadex::MangadexScraper::new()),
                Arc::new(mangapark::MangaparkScraper::new()),
                Arc::new(comick::ComickScraper::new()),
                Arc::new(mangasee::MangaseeScraper::new()),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scraper>> {
        self.scrapers.iter().find(|s| s.name() == name).cloned()
    }

    pub fn for_url(&self, url: &Url) -> Option<(Arc<dyn Scraper>, String)> {
        self.scrapers.iter().find_map(|s| {
            s.source_id_from_url(url)
                .map(|id| (Arc::clone(s), id))
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.scrapers.iter().map(|s| s.name()).collect()
    }
}

/// Scrape a series behind the source's circuit breaker. Rate-limit
/// rejections pass through without tripping it; blocks, timeouts and
/// network failures count toward opening it.
pub async fn scrape_series_guarded(
    kv: &Kv,
    scraper: &dyn Scraper,
    source_id: &str,
) -> Result<ScrapedSeries> {
    breaker::preflight(kv, scraper.name()).await?;
    match scraper.scrape_series(source_id).await {
        Ok(series) => {
            breaker::record_success(kv, scraper.name()).await?;
            Ok(series)
        }
        Err(err) => {
            if trips_breaker(&err) {
                breaker::record_failure(kv, scraper.name()).await?;
            }
            Err(err)
        }
    }
}

/// Search a provider's catalog behind the same breaker.
pub async fn search_guarded(
    kv: &Kv,
    scraper: &dyn Scraper,
    query: &str,
) -> Result<Vec<ScrapedSeriesSummary>> {
    breaker::preflight(kv, scraper.name()).await?;
    match scraper.search(query).await {
        Ok(hits) => {
            breaker::record_success(kv, scraper.name()).await?;
            Ok(hits)
        }
        Err(err) => {
            if trips_breaker(&err) {
                breaker::record_failure(kv, scraper.name()).await?;
            }
            Err(err)
        }
    }
}

fn trips_breaker(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UpstreamBlocked | ErrorKind::Timeout
    )
}

pub const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(OUTBOUND_TIMEOUT)
        .user_agent("chapterwatch/0.1 (catalog sync)")
        .build()
        .expect("Failed to build http client.")
}

/// Map an upstream HTTP status onto the error taxonomy.
pub(crate) fn classify_status(source: &str, status: reqwest::StatusCode) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        429 => Error::RateLimited {
            source_name: source.to_string(),
            wait_ms: 1000,
        },
        401 => Error::Unauthorized(format!("{} rejected credentials", source)),
        403 | 451 => Error::UpstreamBlocked(format!("{} returned {}", source, status)),
        404 => Error::NotFound(format!("{} returned 404", source)),
        _ => Error::UpstreamBlocked(format!("{} returned {}", source, status)),
    })
}

pub(crate) fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Parse a provider chapter label ("Chapter 105.5", "Ch. 12", "12") into a
/// chapter number. Returns None for specials without one.
pub(crate) fn parse_chapter_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let candidate = trimmed
        .rsplit(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .next()
        .unwrap_or(trimmed);
    let cleaned: String = candidate
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_number_parsing() {
        assert_eq!(parse_chapter_number("Chapter 105.5"), Some(105.5));
        assert_eq!(parse_chapter_number("Ch. 12"), Some(12.0));
        assert_eq!(parse_chapter_number("12"), Some(12.0));
        assert_eq!(parse_chapter_number("oneshot"), None);
        assert_eq!(parse_chapter_number("my-title-chapter-7"), Some(7.0));
    }

    #[test]
    fn status_classification() {
        let rate = classify_status("mangadex", reqwest::StatusCode::TOO_MANY_REQUESTS).unwrap();
        assert_eq!(rate.kind(), ErrorKind::RateLimited);
        let blocked = classify_status("mangadex", reqwest::StatusCode::FORBIDDEN).unwrap();
        assert_eq!(blocked.kind(), ErrorKind::UpstreamBlocked);
        assert!(classify_status("mangadex", reqwest::StatusCode::OK).is_none());
    }

    #[test]
    fn only_blocks_and_timeouts_trip_the_breaker() {
        assert!(trips_breaker(&Error::UpstreamBlocked("waf".into())));
        assert!(trips_breaker(&Error::Timeout("slow".into())));
        assert!(!trips_breaker(&Error::RateLimited {
            source_name: "mangadex".into(),
            wait_ms: 1000
        }));
        assert!(!trips_breaker(&Error::UpstreamSchemaChanged("selector".into())));
        assert!(!trips_breaker(&Error::InvalidInput("bad id".into())));
    }

    #[test]
    fn registry_knows_every_source() {
        let registry = ScraperRegistry::with_default_sources();
        for name in ["mangadex", "mangapark", "comick", "mangasee"] {
            assert!(registry.get(name).is_some(), "missing adapter {}", name);
        }
        assert!(registry.get("aggregatorx").is_none());
    }
}
