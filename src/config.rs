//! Configuration loader and validator for the news desk.
use crate::model::{Author, EmojiMap, Filter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
pub const DEFAULT_IMAGE_PROMPT: &str = "Create an image for a Telegram post based on the following text: {postText}. The image should have a stylish, minimalistic design with modern, fashionable gradients.";
pub const DEFAULT_IMAGE_QUALITY: &str = "medium";
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub llm: Llm,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub bind: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
    #[serde(default = "default_true")]
    pub enrich: bool,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_enrich_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// Language-model API settings. An empty key disables scoring, rewriting and
/// image generation (calls fail with a clear error).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Llm {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
}

impl Default for Llm {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
}

/// One pollable source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub label: String,
    pub kind: SourceKind,
    pub url: String,
}

/// An isolated configuration scope owned by one login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub login: String,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub emojis: EmojiMap,
}

impl Tenant {
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn filter(&self, id: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.id == id)
    }

    pub fn author(&self, id: &str) -> Option<&Author> {
        self.authors.iter().find(|a| a.id == id)
    }
}

/// Per-instance publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_prompt")]
    pub image_prompt: String,
    #[serde(default = "default_image_quality")]
    pub image_quality: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    #[serde(default)]
    pub post_suffix: String,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            approvers: Vec::new(),
            image_model: default_image_model(),
            image_prompt: default_image_prompt(),
            image_quality: default_image_quality(),
            image_size: default_image_size(),
            post_suffix: String::new(),
        }
    }
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_image_prompt() -> String {
    DEFAULT_IMAGE_PROMPT.to_string()
}

fn default_image_quality() -> String {
    DEFAULT_IMAGE_QUALITY.to_string()
}

fn default_image_size() -> String {
    DEFAULT_IMAGE_SIZE.to_string()
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `BOT_TOKEN` and `OPENAI_API_KEY` override the file's secrets when set.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(token) = std::env::var("BOT_TOKEN") {
        cfg.telegram.bot_token = token;
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        cfg.llm.api_key = key;
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind must be non-empty"));
    }
    if cfg.app.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_secs must be > 0"));
    }
    if cfg.app.enrich_concurrency == 0 {
        return Err(ConfigError::Invalid("app.enrich_concurrency must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    for source in cfg.sources.values() {
        if source.url.trim().is_empty() {
            return Err(ConfigError::Invalid("sources.*.url must be non-empty"));
        }
    }

    let mut logins = std::collections::HashSet::new();
    for tenant in &cfg.tenants {
        if tenant.login.trim().is_empty() {
            return Err(ConfigError::Invalid("tenants.*.login must be non-empty"));
        }
        if !logins.insert(tenant.login.as_str()) {
            return Err(ConfigError::Invalid("tenants.*.login must be unique"));
        }
        if tenant.instances.iter().any(|i| i.id.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "tenants.*.instances.*.id must be non-empty",
            ));
        }
        if tenant
            .filters
            .iter()
            .any(|f| f.model.trim().is_empty() || f.instructions.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "tenants.*.filters.* need a model and instructions",
            ));
        }
        if tenant
            .authors
            .iter()
            .any(|a| a.model.trim().is_empty() || a.instructions.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "tenants.*.authors.* need a model and instructions",
            ));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  bind: "127.0.0.1:3001"
  poll_interval_secs: 60
  enrich_concurrency: 2
  enrich: true

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

llm:
  api_key: ""
  base_url: "https://api.openai.com/v1"

sources:
  bbc:
    label: "BBC"
    kind: rss
    url: "http://feeds.bbci.co.uk/news/world/rss.xml"
  guardian:
    label: "The Guardian"
    kind: rss
    url: "https://www.theguardian.com/world/rss"

tenants:
  - login: "root"
    instances:
      - id: "default"
        approvers: ["Alice"]
        post_suffix: ""
    filters:
      - id: "relevance"
        title: "Relevance"
        model: "gpt-4o-mini"
        instructions: "Rate the relevance of the post from 0 to 10."
        minScore: 7
    authors:
      - id: "editor"
        title: "Editor"
        model: "gpt-4o-mini"
        instructions: "Rewrite the post as a short Telegram update."
    emojis:
      "😀": "5368324170671202286"
"#
}
