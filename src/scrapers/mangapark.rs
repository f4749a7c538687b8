use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use crate::error::{Error, Result};
use crate::safe_url;

use super::{
    classify_status, http_client, parse_chapter_number, urlencode, ScrapedChapter, ScrapedSeries,
    ScrapedSeriesSummary, Scraper,
};

const SITE_BASE: &str = "https://mangapark.io";

pub struct MangaparkScraper {
    client: reqwest::Client,
}

impl MangaparkScraper {
    pub fn new() -> MangaparkScraper {
        MangaparkScraper {
            client: http_client(),
        }
    }

    async fn get_html(&self, url: &str) -> Result<Html> {
        let url = safe_url::validate(url)?;
        let response = self.client.get(url).send().await?;
        if let Some(err) = classify_status("mangapark", response.status()) {
            return Err(err);
        }
        let body = response.text().await?;
        Ok(Html::parse_document(&body))
    }
}

/// Ids look like `12345-en-solo-leveling`: a numeric prefix, then slug.
fn is_valid_title_id(source_id: &str) -> bool {
    let mut parts = source_id.splitn(2, '-');
    let numeric = parts
        .next()
        .map(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    numeric
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn select_text(doc: &Html, selector: &Selector) -> Option<String> {
    let text = doc
        .select(selector)
        .next()?
        .text()
        .fold(String::new(), |a, b| a + b)
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl Scraper for MangaparkScraper {
    fn name(&self) -> &'static str {
        "mangapark"
    }

    fn validate_source_id(&self, source_id: &str) -> Result<()> {
        if is_valid_title_id(source_id) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{:?} is not a mangapark title id",
                source_id
            )))
        }
    }

    fn source_id_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(url.host_str(), Some("mangapark.io") | Some("www.mangapark.io")) {
            return None;
        }
        let mut segments = url.path_segments()?;
        if segments.next()? != "title" {
            return None;
        }
        let id = segments.next()?;
        is_valid_title_id(id).then(|| id.to_string())
    }

    #[tracing::instrument(name = "Scraping a mangapark series.", err, level = "info", skip(self))]
    async fn scrape_series(&self, source_id: &str) -> Result<ScrapedSeries> {
        self.validate_source_id(source_id)?;

        let doc = self
            .get_html(&format!("{}/title/{}", SITE_BASE, source_id))
            .await?;

        let title_selector = Selector::parse("h3.item-title a, h1[data-title]").unwrap();
        let alt_selector = Selector::parse("div.alias-set span.alias-item").unwrap();
        let chapter_selector = Selector::parse("div.episode-list a.chapt").unwrap();
        let cover_selector = Selector::parse("div.attr-cover img").unwrap();

        let title = select_text(&doc, &title_selector).ok_or_else(|| {
            Error::UpstreamSchemaChanged("failed to find title element on mangapark page".into())
        })?;

        let alt_titles = doc
            .select(&alt_selector)
            .map(|el| {
                el.text()
                    .fold(String::new(), |a, b| a + b)
                    .trim()
                    .to_string()
            })
            .filter(|t| !t.is_empty())
            .collect();

        let cover_url = doc
            .select(&cover_selector)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(|src| {
                if src.starts_with("http") {
                    src.to_string()
                } else {
                    format!("{}{}", SITE_BASE, src)
                }
            });

        let mut chapters = Vec::new();
        for link in doc.select(&chapter_selector) {
            let label = link.text().fold(String::new(), |a, b| a + b);
            let number = match parse_chapter_number(&label) {
                Some(n) => n,
                None => continue,
            };
            let href = match link.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            chapters.push(ScrapedChapter {
                chapter_number: number,
                chapter_title: None,
                chapter_url: if href.starts_with("http") {
                    href.to_string()
                } else {
                    format!("{}{}", SITE_BASE, href)
                },
                scanlation_group: None,
                language: Some("en".into()),
                published_at: None,
            });
        }
        if chapters.is_empty() {
            return Err(Error::UpstreamSchemaChanged(
                "failed to find any chapter links on mangapark page".into(),
            ));
        }

        Ok(ScrapedSeries {
            source_id: source_id.to_string(),
            title,
            alt_titles,
            cover_url,
            content_rating: None,
            chapters,
        })
    }

    #[tracing::instrument(name = "Searching the mangapark catalog.", err, level = "info", skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<ScrapedSeriesSummary>> {
        let doc = self
            .get_html(&format!("{}/search?word={}", SITE_BASE, urlencode(query)))
            .await?;
        let hit_selector = Selector::parse("div.item div.item-title a").unwrap();

        let mut hits = Vec::new();
        for link in doc.select(&hit_selector) {
            let title = link.text().fold(String::new(), |a, b| a + b).trim().to_string();
            let href = match link.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            let id = match href.trim_start_matches('/').strip_prefix("title/") {
                Some(rest) => rest.split('/').next().unwrap_or(""),
                None => continue,
            };
            if title.is_empty() || !is_valid_title_id(id) {
                continue;
            }
            hits.push(ScrapedSeriesSummary {
                source_id: id.to_string(),
                title,
                alt_titles: Vec::new(),
                cover_url: None,
            });
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_id_validation() {
        assert!(is_valid_title_id("12345-en-solo-leveling"));
        assert!(is_valid_title_id("777"));
        assert!(!is_valid_title_id("solo-leveling"));
        assert!(!is_valid_title_id(""));
        assert!(!is_valid_title_id("123/../etc"));
    }

    #[test]
    fn resolves_title_urls() {
        let scraper = MangaparkScraper::new();
        let url = Url::parse("https://mangapark.io/title/12345-en-solo-leveling/ch-1").unwrap();
        assert_eq!(
            scraper.source_id_from_url(&url).as_deref(),
            Some("12345-en-solo-leveling")
        );
    }
}
