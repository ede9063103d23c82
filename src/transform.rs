//! Content transforms: custom-emoji substitution, LLM scoring and rewriting,
//! emoji-pack parsing and image prompt assembly. Everything here is
//! parameterized by tenant configuration and never touches pipeline state.
use crate::config::{Instance, DEFAULT_IMAGE_QUALITY, DEFAULT_IMAGE_SIZE};
use crate::llm::{ImageRequest, LanguageModel};
use crate::model::{Author, EmojiMap, Filter};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

const IMAGE_QUALITIES: &[&str] = &["low", "medium", "high"];
const IMAGE_SIZES: &[&str] = &["1024x1024", "1024x1536", "1536x1024"];
const DALL_E2_SIZES: &[&str] = &["256x256", "512x512", "1024x1024"];

static SCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid score regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmojiSubstitution {
    pub text: String,
    /// Emoji that occurred at least once, in map order.
    pub replaced: Vec<String>,
}

/// Wrap every known emoji in Telegram's custom-emoji markup.
///
/// All keys are matched in one pass, longest first, so a key that is a prefix
/// of another (`❤` and `❤️`) never splits the longer one, and inserted markup
/// is never rescanned.
pub fn apply_custom_emojis(text: &str, emojis: &EmojiMap) -> EmojiSubstitution {
    let mut keys: Vec<&str> = emojis
        .iter()
        .filter(|(emoji, id)| !emoji.is_empty() && !id.is_empty())
        .map(|(emoji, _)| emoji.as_str())
        .collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()));
    let pattern = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let re = match Regex::new(&pattern) {
        Ok(re) if !keys.is_empty() => re,
        _ => {
            return EmojiSubstitution {
                text: text.to_string(),
                replaced: Vec::new(),
            }
        }
    };

    let mut matched = BTreeSet::new();
    let result = re.replace_all(text, |caps: &regex::Captures| {
        let emoji = &caps[0];
        matched.insert(emoji.to_string());
        let id = emojis.get(emoji).map(String::as_str).unwrap_or_default();
        format!("<tg-emoji emoji-id=\"{}\">{}</tg-emoji>", id, emoji)
    });
    let text = result.into_owned();
    EmojiSubstitution {
        text,
        replaced: emojis
            .keys()
            .filter(|emoji| matched.contains(*emoji))
            .cloned()
            .collect(),
    }
}

/// First decimal number in a model response, or 0.
pub fn extract_score(content: &str) -> f64 {
    SCORE
        .find(content)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub content: String,
    pub tokens: u64,
}

impl Score {
    pub fn passes(&self, filter: &Filter) -> bool {
        self.value >= filter.min_score
    }
}

/// Ask the filter's model to score `text`. Never rejects on its own.
pub async fn score(llm: &dyn LanguageModel, filter: &Filter, text: &str) -> Result<Score> {
    let completion = llm.complete(&filter.model, &filter.instructions, text).await?;
    Ok(Score {
        value: extract_score(&completion.text),
        content: completion.text,
        tokens: completion.tokens,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    pub tokens: u64,
}

/// The author's model response, verbatim, is the new body.
pub async fn rewrite(llm: &dyn LanguageModel, author: &Author, text: &str) -> Result<Rewrite> {
    let completion = llm.complete(&author.model, &author.instructions, text).await?;
    Ok(Rewrite {
        text: completion.text,
        tokens: completion.tokens,
    })
}

/// A custom-emoji entity of a chat message. Offsets are UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmojiEntity {
    pub offset: usize,
    pub custom_emoji_id: String,
}

/// Parse lines shaped like `😀 - <custom emoji>` into an emoji map. A line
/// counts when a custom-emoji entity starts after its first dash.
pub fn parse_emoji_pack(text: &str, entities: &[EmojiEntity]) -> EmojiMap {
    let mut result = EmojiMap::new();
    let mut offset = 0usize;
    for line in text.split('\n') {
        let line_len = line.encode_utf16().count();
        if let Some(dash) = line.find('-') {
            let regular = line[..dash].trim();
            if !regular.is_empty() {
                let start = offset + line[..dash].encode_utf16().count() + 1;
                let end = offset + line_len;
                if let Some(entity) = entities
                    .iter()
                    .find(|e| e.offset >= start && e.offset < end)
                {
                    result.insert(regular.to_string(), entity.custom_emoji_id.clone());
                }
            }
        }
        offset += line_len + 1;
    }
    result
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageOverrides {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub quality: Option<String>,
    pub size: Option<String>,
}

/// Build an image request for a post from instance settings and overrides.
pub fn image_request(instance: &Instance, overrides: &ImageOverrides, post_text: &str) -> ImageRequest {
    let model = overrides
        .model
        .clone()
        .unwrap_or_else(|| instance.image_model.clone());
    let base = overrides
        .prompt
        .as_deref()
        .unwrap_or(&instance.image_prompt);
    let quality = overrides
        .quality
        .as_deref()
        .unwrap_or(&instance.image_quality);
    let quality = if IMAGE_QUALITIES.contains(&quality) {
        quality
    } else {
        DEFAULT_IMAGE_QUALITY
    };
    let size = overrides.size.as_deref().unwrap_or(&instance.image_size);
    let allowed = if model == "dall-e-2" {
        DALL_E2_SIZES
    } else {
        IMAGE_SIZES
    };
    let size = if allowed.contains(&size) {
        size
    } else {
        DEFAULT_IMAGE_SIZE
    };
    ImageRequest {
        prompt: base.replace("{postText}", post_text),
        model,
        size: size.to_string(),
        quality: quality.to_string(),
    }
}
