//! Backfill of article text and image for freshly discovered items.
use crate::model::Item;
use crate::queue::BoundedQueue;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};

/// Fields an enricher may fill in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub text: Option<String>,
    pub image: Option<String>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, item: &Item) -> Result<Enrichment>;
}

/// Fetches the article page and reads its Open Graph description and image.
pub struct HttpEnricher {
    http: reqwest::Client,
}

impl HttpEnricher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, item: &Item) -> Result<Enrichment> {
        let res = self
            .http
            .get(&item.url)
            .send()
            .await
            .with_context(|| format!("failed to fetch article {}", item.url))?;
        if !res.status().is_success() {
            return Err(anyhow!("article {} returned {}", item.url, res.status()));
        }
        let page = res.text().await.context("failed to read article body")?;
        Ok(extract_open_graph(&page))
    }
}

/// Pull `og:description` and `og:image` out of an HTML page.
pub fn extract_open_graph(page: &str) -> Enrichment {
    let document = Html::parse_document(page);
    Enrichment {
        text: meta_content(&document, "og:description"),
        image: meta_content(&document, "og:image"),
    }
}

/// First non-empty `content` of a `<meta>` keyed by `property=`, then by `name=`.
fn meta_content(document: &Html, key: &str) -> Option<String> {
    ["property", "name"].iter().find_map(|attr| {
        let selector = Selector::parse(&format!(r#"meta[{}="{}"]"#, attr, key)).ok()?;
        document
            .select(&selector)
            .filter_map(|el| el.value().attr("content"))
            .map(str::trim)
            .find(|content| !content.is_empty())
            .map(str::to_string)
    })
}

/// Enrich `item` through the shared queue. Failures leave the item as it was.
pub async fn enrich_item(queue: &BoundedQueue, enricher: &dyn Enricher, mut item: Item) -> Item {
    if !item.needs_enrichment() {
        return item;
    }
    match queue.submit(enricher.enrich(&item)).await {
        Ok(extra) => {
            debug!(url = %item.url, "enriched item");
            if item.text.as_deref().map_or(true, |t| t.trim().is_empty()) {
                if let Some(text) = extra.text {
                    item.text = Some(text);
                }
            }
            if item.image.is_none() {
                if let Some(image) = extra.image {
                    if !item.media.contains(&image) {
                        item.media.push(image.clone());
                    }
                    item.image = Some(image);
                }
            }
        }
        Err(err) => warn!(?err, url = %item.url, "enrichment failed; delivering as is"),
    }
    item
}
