//! Source adapters: one implementation per external source kind.
use crate::config::{SourceConfig, SourceKind};
use crate::model::Item;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod rss;

pub use rss::RssSource;

/// Pulls the current items of one external source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human-readable label.
    fn label(&self) -> &str;

    /// Items currently published by the source, in source order.
    async fn fetch(&self) -> Result<Vec<Item>>;
}

/// Source id -> adapter. Shared read-only by every stream.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        sources: &BTreeMap<String, SourceConfig>,
        http: reqwest::Client,
    ) -> Self {
        let mut registry = Self::new();
        for (id, cfg) in sources {
            let adapter: Arc<dyn SourceAdapter> = match cfg.kind {
                SourceKind::Rss => Arc::new(RssSource::new(
                    cfg.label.clone(),
                    cfg.url.clone(),
                    http.clone(),
                )),
            };
            registry.insert(id.clone(), adapter);
        }
        registry
    }

    pub fn insert(&mut self, id: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(id.into(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// (id, label) pairs in id order.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.adapters
            .iter()
            .map(|(id, a)| (id.clone(), a.label().to_string()))
            .collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
