use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scraped post. Identity is `url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_image: Option<String>,
}

impl Item {
    /// True when the item still lacks the fields enrichment can backfill.
    pub fn needs_enrichment(&self) -> bool {
        let no_text = self.text.as_deref().map_or(true, |t| t.trim().is_empty());
        no_text || self.image.is_none()
    }
}

/// Connection state of one source as seen by a stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Connected,
    Error,
}

/// Events pushed to a stream subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Item(Item),
    Status {
        source: String,
        status: SourceStatus,
        message: Option<String>,
    },
    Ping {
        source: String,
        time: i64,
    },
    Log {
        message: String,
    },
}

impl StreamEvent {
    /// SSE event name; `None` for plain item events.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            StreamEvent::Item(_) => None,
            StreamEvent::Status { .. } => Some("status"),
            StreamEvent::Ping { .. } => Some("ping"),
            StreamEvent::Log { .. } => Some("log"),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            StreamEvent::Item(item) => serde_json::to_value(item).unwrap_or_default(),
            StreamEvent::Status {
                source,
                status,
                message,
            } => {
                let mut v = serde_json::json!({ "source": source, "status": status });
                if let Some(m) = message {
                    v["message"] = serde_json::Value::String(m.clone());
                }
                v
            }
            StreamEvent::Ping { source, time } => {
                serde_json::json!({ "source": source, "time": time })
            }
            StreamEvent::Log { message } => serde_json::json!({ "message": message }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PostState {
    Queued,
    ImageRequested,
}

/// Content waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingPost {
    pub id: String,
    pub channel: String,
    pub text: String,
    pub media: Option<String>,
    pub instance_id: Option<String>,
    pub login: String,
    pub state: PostState,
    pub created_at: DateTime<Utc>,
}

/// LLM relevance scorer with a pass threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub model: String,
    pub instructions: String,
    #[serde(default)]
    pub vector_store_id: Option<String>,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_min_score() -> f64 {
    7.0
}

/// LLM rewriting profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub model: String,
    pub instructions: String,
    #[serde(default)]
    pub vector_store_id: Option<String>,
}

/// Literal emoji -> platform custom emoji id. Ordered so substitution and
/// its replaced-list are deterministic.
pub type EmojiMap = BTreeMap<String, String>;
