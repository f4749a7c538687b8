use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::safe_url;

use super::{
    classify_status, http_client, parse_chapter_number, urlencode, ScrapedChapter, ScrapedSeries,
    ScrapedSeriesSummary, Scraper,
};

const API_BASE: &str = "https://api.comick.io";

pub struct ComickScraper {
    client: reqwest::Client,
}

impl ComickScraper {
    pub fn new() -> ComickScraper {
        ComickScraper {
            client: http_client(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let url = safe_url::validate(url)?;
        let response = self.client.get(url).send().await?;
        if let Some(err) = classify_status("comick", response.status()) {
            return Err(err);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::UpstreamSchemaChanged(format!("comick payload: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct ComicResponse {
    comic: Comic,
}

#[derive(Debug, Deserialize)]
struct Comic {
    slug: String,
    title: String,
    #[serde(default)]
    md_titles: Vec<MdTitle>,
    #[serde(rename = "content_rating")]
    content_rating: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MdTitle {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChapterListResponse {
    chapters: Vec<ComickChapter>,
}

#[derive(Debug, Deserialize)]
struct ComickChapter {
    hid: String,
    chap: Option<String>,
    title: Option<String>,
    lang: Option<String>,
    #[serde(default)]
    group_name: Vec<String>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    slug: String,
    title: String,
}

/// Slugs are lowercase words joined by dashes, e.g. `one-punch-man`.
fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[async_trait]
impl Scraper for ComickScraper {
    fn name(&self) -> &'static str {
        "comick"
    }

    fn validate_source_id(&self, source_id: &str) -> Result<()> {
        if is_valid_slug(source_id) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{:?} is not a comick slug",
                source_id
            )))
        }
    }

    fn source_id_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(url.host_str(), Some("comick.io") | Some("api.comick.io")) {
            return None;
        }
        let mut segments = url.path_segments()?;
        if segments.next()? != "comic" {
            return None;
        }
        let slug = segments.next()?;
        is_valid_slug(slug).then(|| slug.to_string())
    }

    #[tracing::instrument(name = "Scraping a comick series.", err, level = "info", skip(self))]
    async fn scrape_series(&self, source_id: &str) -> Result<ScrapedSeries> {
        self.validate_source_id(source_id)?;

        let comic: ComicResponse = self
            .get_json(&format!("{}/comic/{}", API_BASE, source_id))
            .await?;
        let list: ChapterListResponse = self
            .get_json(&format!(
                "{}/comic/{}/chapters?limit=500",
                API_BASE, source_id
            ))
            .await?;

        let chapters = list
            .chapters
            .into_iter()
            .filter_map(|item| {
                let number = item.chap.as_deref().and_then(parse_chapter_number)?;
                Some(ScrapedChapter {
                    chapter_number: number,
                    chapter_title: item.title.filter(|t| !t.is_empty()),
                    chapter_url: format!("https://comick.io/comic/{}/{}", source_id, item.hid),
                    scanlation_group: item.group_name.into_iter().next(),
                    language: item.lang,
                    published_at: item.created_at,
                })
            })
            .collect();

        Ok(ScrapedSeries {
            source_id: comic.comic.slug,
            title: comic.comic.title,
            alt_titles: comic
                .comic
                .md_titles
                .into_iter()
                .map(|t| t.title)
                .collect(),
            cover_url: None,
            content_rating: comic.comic.content_rating,
            chapters,
        })
    }

    #[tracing::instrument(name = "Searching the comick catalog.", err, level = "info", skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<ScrapedSeriesSummary>> {
        let hits: Vec<SearchHit> = self
            .get_json(&format!(
                "{}/v1.0/search?q={}&limit=10",
                API_BASE,
                urlencode(query)
            ))
            .await?;
        Ok(hits
            .into_iter()
            .map(|h| ScrapedSeriesSummary {
                source_id: h.slug,
                title: h.title,
                alt_titles: Vec::new(),
                cover_url: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation() {
        let scraper = ComickScraper::new();
        assert!(scraper.validate_source_id("one-punch-man").is_ok());
        assert!(scraper.validate_source_id("Solo Leveling").is_err());
        assert!(scraper.validate_source_id("").is_err());
    }

    #[test]
    fn resolves_comic_urls() {
        let scraper = ComickScraper::new();
        let url = Url::parse("https://comick.io/comic/one-punch-man").unwrap();
        assert_eq!(
            scraper.source_id_from_url(&url).as_deref(),
            Some("one-punch-man")
        );
    }
}
