use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::safe_url;

use super::{
    classify_status, http_client, parse_chapter_number, ScrapedChapter, ScrapedSeries,
    ScrapedSeriesSummary, Scraper,
};

const SITE_BASE: &str = "https://mangasee123.com";

/// Mangasee publishes per-series RSS feeds; the chapter catalog comes from
/// there rather than from page markup.
pub struct MangaseeScraper {
    client: reqwest::Client,
}

impl MangaseeScraper {
    pub fn new() -> MangaseeScraper {
        MangaseeScraper {
            client: http_client(),
        }
    }
}

/// Index names are PascalCase-with-dashes, e.g. `Oyasumi-Punpun`.
fn is_valid_index_name(source_id: &str) -> bool {
    !source_id.is_empty()
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    /// Index name.
    i: String,
    /// Display name.
    s: String,
    /// Alternate names.
    #[serde(default)]
    a: Vec<String>,
}

fn parse_published(pub_date: Option<&str>) -> Option<DateTime<Utc>> {
    pub_date
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Scraper for MangaseeScraper {
    fn name(&self) -> &'static str {
        "mangasee"
    }

    fn validate_source_id(&self, source_id: &str) -> Result<()> {
        if is_valid_index_name(source_id) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{:?} is not a mangasee index name",
                source_id
            )))
        }
    }

    fn source_id_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(
            url.host_str(),
            Some("mangasee123.com") | Some("www.mangasee123.com")
        ) {
            return None;
        }
        let mut segments = url.path_segments()?;
        if segments.next()? != "manga" {
            return None;
        }
        let id = segments.next()?;
        is_valid_index_name(id).then(|| id.to_string())
    }

    #[tracing::instrument(name = "Scraping a mangasee series feed.", err, level = "info", skip(self))]
    async fn scrape_series(&self, source_id: &str) -> Result<ScrapedSeries> {
        self.validate_source_id(source_id)?;

        let feed_url = format!("{}/rss/{}.xml", SITE_BASE, source_id);
        let validated = safe_url::validate(&feed_url)?;
        let response = self.client.get(validated).send().await?;
        if let Some(err) = classify_status("mangasee", response.status()) {
            return Err(err);
        }
        let content = response.bytes().await?;
        let channel = rss::Channel::read_from(&content[..])
            .map_err(|e| Error::UpstreamSchemaChanged(format!("mangasee feed: {}", e)))?;

        let title = channel.title().trim().to_string();
        if title.is_empty() {
            return Err(Error::UpstreamSchemaChanged(
                "mangasee feed has an empty channel title".into(),
            ));
        }

        let chapters = channel
            .items()
            .iter()
            .filter_map(|item| {
                let link = item.link()?;
                let number = parse_chapter_number(item.title().unwrap_or(link))?;
                Some(ScrapedChapter {
                    chapter_number: number,
                    chapter_title: None,
                    chapter_url: link.to_string(),
                    scanlation_group: None,
                    language: Some("en".into()),
                    published_at: parse_published(item.pub_date()),
                })
            })
            .collect();

        Ok(ScrapedSeries {
            source_id: source_id.to_string(),
            title,
            alt_titles: Vec::new(),
            cover_url: Some(format!(
                "https://temp.compsci88.com/cover/{}.jpg",
                source_id
            )),
            content_rating: None,
            chapters,
        })
    }

    #[tracing::instrument(name = "Searching the mangasee directory.", err, level = "info", skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<ScrapedSeriesSummary>> {
        let url = safe_url::validate(&format!("{}/_search.php", SITE_BASE))?;
        let response = self.client.get(url).send().await?;
        if let Some(err) = classify_status("mangasee", response.status()) {
            return Err(err);
        }
        let directory: Vec<DirectoryEntry> = response
            .json()
            .await
            .map_err(|e| Error::UpstreamSchemaChanged(format!("mangasee directory: {}", e)))?;

        let needle = query.to_lowercase();
        Ok(directory
            .into_iter()
            .filter(|entry| {
                entry.s.to_lowercase().contains(&needle)
                    || entry.a.iter().any(|alt| alt.to_lowercase().contains(&needle))
            })
            .take(10)
            .map(|entry| ScrapedSeriesSummary {
                source_id: entry.i,
                title: entry.s,
                alt_titles: entry.a,
                cover_url: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_validation() {
        assert!(is_valid_index_name("Oyasumi-Punpun"));
        assert!(!is_valid_index_name("Oyasumi Punpun"));
        assert!(!is_valid_index_name(""));
    }

    #[test]
    fn parses_rfc2822_dates() {
        let parsed = parse_published(Some("Sat, 06 Jun 2026 09:30:00 +0000"));
        assert!(parsed.is_some());
        assert!(parse_published(Some("june sometime")).is_none());
        assert!(parse_published(None).is_none());
    }
}
