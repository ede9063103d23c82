use super::SourceAdapter;
use crate::model::Item;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use feed_rs::model::{Entry, Feed};
use tracing::{debug, instrument};

/// RSS/Atom feed polled over HTTP.
pub struct RssSource {
    label: String,
    url: String,
    http: reqwest::Client,
}

impl RssSource {
    pub fn new(label: String, url: String, http: reqwest::Client) -> Self {
        Self { label, url, http }
    }
}

#[async_trait]
impl SourceAdapter for RssSource {
    fn label(&self) -> &str {
        &self.label
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<Item>> {
        let res = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to reach feed {}", self.url))?;
        if !res.status().is_success() {
            return Err(anyhow!("feed {} returned {}", self.url, res.status()));
        }
        let body = res.bytes().await.context("failed to read feed body")?;
        let items = parse_feed(&body)?;
        debug!(count = items.len(), "parsed feed");
        Ok(items)
    }
}

/// Parse feed bytes into items, skipping entries without a link.
pub fn parse_feed(body: &[u8]) -> Result<Vec<Item>> {
    let feed = feed_rs::parser::parse(body).map_err(|e| anyhow!("failed to parse feed: {}", e))?;
    Ok(items_from_feed(feed))
}

fn items_from_feed(feed: Feed) -> Vec<Item> {
    let channel_title = feed.title.map(|t| t.content);
    let channel_image = feed.logo.or(feed.icon).map(|i| i.uri);
    feed.entries
        .into_iter()
        .filter_map(|entry| {
            let mut item = item_from_entry(entry)?;
            item.channel_title = channel_title.clone();
            item.channel_image = channel_image.clone();
            Some(item)
        })
        .collect()
}

fn item_from_entry(entry: Entry) -> Option<Item> {
    let url = entry.links.first()?.href.clone();
    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled".to_string());
    let html = entry.content.as_ref().and_then(|c| c.body.clone());
    let text = entry
        .summary
        .map(|s| s.content)
        .or_else(|| html.clone());
    let media: Vec<String> = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter().filter_map(|c| c.url.as_ref()))
        .map(|u| u.to_string())
        .chain(
            entry
                .media
                .iter()
                .flat_map(|m| m.thumbnails.iter().map(|t| t.image.uri.clone())),
        )
        .fold(Vec::new(), |mut acc, u| {
            if !acc.contains(&u) {
                acc.push(u);
            }
            acc
        });
    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc));

    Some(Item {
        url,
        title,
        text,
        html,
        image: media.first().cloned(),
        media,
        published_at,
        ..Default::default()
    })
}
