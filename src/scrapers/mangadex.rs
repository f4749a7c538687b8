use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::safe_url;

use super::{
    classify_status, http_client, parse_chapter_number, urlencode, ScrapedChapter, ScrapedSeries,
    ScrapedSeriesSummary, Scraper,
};

const API_BASE: &str = "https://api.mangadex.org";
const CHAPTER_PAGE_LIMIT: usize = 500;

pub struct MangadexScraper {
    client: reqwest::Client,
}

impl MangadexScraper {
    pub fn new() -> MangadexScraper {
        MangadexScraper {
            client: http_client(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let url = safe_url::validate(url)?;
        let response = self.client.get(url).send().await?;
        if let Some(err) = classify_status("mangadex", response.status()) {
            return Err(err);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::UpstreamSchemaChanged(format!("mangadex payload: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct MangaResponse {
    data: MangaData,
}

#[derive(Debug, Deserialize)]
struct MangaListResponse {
    data: Vec<MangaData>,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
}

#[derive(Debug, Deserialize)]
struct MangaAttributes {
    title: HashMap<String, String>,
    #[serde(default)]
    #[serde(rename = "altTitles")]
    alt_titles: Vec<HashMap<String, String>>,
    #[serde(rename = "contentRating")]
    content_rating: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    data: Vec<FeedChapter>,
}

#[derive(Debug, Deserialize)]
struct FeedChapter {
    id: String,
    attributes: FeedChapterAttributes,
}

#[derive(Debug, Deserialize)]
struct FeedChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    #[serde(rename = "translatedLanguage")]
    translated_language: Option<String>,
    #[serde(rename = "publishAt")]
    publish_at: Option<DateTime<Utc>>,
}

impl MangaAttributes {
    fn display_title(&self) -> Option<String> {
        self.title
            .get("en")
            .or_else(|| self.title.values().next())
            .cloned()
    }

    fn flattened_alt_titles(&self) -> Vec<String> {
        self.alt_titles
            .iter()
            .flat_map(|m| m.values().cloned())
            .collect()
    }
}

#[async_trait]
impl Scraper for MangadexScraper {
    fn name(&self) -> &'static str {
        "mangadex"
    }

    fn validate_source_id(&self, source_id: &str) -> Result<()> {
        Uuid::parse_str(source_id)
            .map(|_| ())
            .map_err(|_| Error::InvalidInput(format!("{:?} is not a mangadex manga id", source_id)))
    }

    fn source_id_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(url.host_str(), Some("mangadex.org") | Some("api.mangadex.org")) {
            return None;
        }
        let mut segments = url.path_segments()?;
        let head = segments.next()?;
        if head != "title" && head != "manga" {
            return None;
        }
        let id = segments.next()?;
        Uuid::parse_str(id).ok().map(|u| u.to_string())
    }

    #[tracing::instrument(name = "Scraping a mangadex series.", err, level = "info", skip(self))]
    async fn scrape_series(&self, source_id: &str) -> Result<ScrapedSeries> {
        self.validate_source_id(source_id)?;

        let manga: MangaResponse = self
            .get_json(&format!("{}/manga/{}", API_BASE, source_id))
            .await?;
        let title = manga.data.attributes.display_title().ok_or_else(|| {
            Error::UpstreamSchemaChanged("mangadex manga has no title field".into())
        })?;

        let feed: FeedResponse = self
            .get_json(&format!(
                "{}/manga/{}/feed?limit={}&order[chapter]=desc",
                API_BASE, source_id, CHAPTER_PAGE_LIMIT
            ))
            .await?;

        let chapters = feed
            .data
            .into_iter()
            .filter_map(|item| {
                let number = item
                    .attributes
                    .chapter
                    .as_deref()
                    .and_then(parse_chapter_number)?;
                Some(ScrapedChapter {
                    chapter_number: number,
                    chapter_title: item.attributes.title.filter(|t| !t.is_empty()),
                    chapter_url: format!("https://mangadex.org/chapter/{}", item.id),
                    scanlation_group: None,
                    language: item.attributes.translated_language,
                    published_at: item.attributes.publish_at,
                })
            })
            .collect();

        Ok(ScrapedSeries {
            source_id: source_id.to_string(),
            title,
            alt_titles: manga.data.attributes.flattened_alt_titles(),
            cover_url: None,
            content_rating: manga.data.attributes.content_rating,
            chapters,
        })
    }

    #[tracing::instrument(name = "Searching the mangadex catalog.", err, level = "info", skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<ScrapedSeriesSummary>> {
        let list: MangaListResponse = self
            .get_json(&format!(
                "{}/manga?title={}&limit=10",
                API_BASE,
                urlencode(query)
            ))
            .await?;
        Ok(list
            .data
            .into_iter()
            .filter_map(|m| {
                Some(ScrapedSeriesSummary {
                    source_id: m.id.clone(),
                    title: m.attributes.display_title()?,
                    alt_titles: m.attributes.flattened_alt_titles(),
                    cover_url: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_non_uuid_ids() {
        let scraper = MangadexScraper::new();
        let err = scraper.validate_source_id("12345").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(scraper
            .validate_source_id("b73cb137-24aa-4d17-bbc5-51c49e8a7b65")
            .is_ok());
    }

    #[test]
    fn resolves_title_urls() {
        let scraper = MangadexScraper::new();
        let url =
            Url::parse("https://mangadex.org/title/b73cb137-24aa-4d17-bbc5-51c49e8a7b65/solo-max")
                .unwrap();
        assert_eq!(
            scraper.source_id_from_url(&url).as_deref(),
            Some("b73cb137-24aa-4d17-bbc5-51c49e8a7b65")
        );
        let foreign = Url::parse("https://mangapark.io/title/12345").unwrap();
        assert!(scraper.source_id_from_url(&foreign).is_none());
    }
}
