//! Per-stream record of item URLs that were already seen.
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct DedupRecord {
    seen: HashSet<String>,
}

impl DedupRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `url` and returns true if it had not been seen before.
    pub fn insert(&mut self, url: &str) -> bool {
        if self.seen.contains(url) {
            return false;
        }
        self.seen.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
