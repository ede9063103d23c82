//! Language-model collaborator: chat completions and image generation.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, instrument};

/// Text returned by a completion plus total token usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub quality: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, model: &str, instructions: &str, text: &str) -> Result<Completion>;

    /// Returns a fetchable URL (or a `data:` URL) of the generated image.
    async fn generate_image(&self, request: &ImageRequest) -> Result<String>;
}

/// OpenAI-compatible HTTP client.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn ensure_key(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("OPENAI_API_KEY not set"));
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.ensure_key()?;
        let url = format!("{}/{}", self.base_url, path);
        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("language model error {}: {}", status, text));
        }
        res.json::<Value>()
            .await
            .context("invalid language model response JSON")
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    #[instrument(skip_all, fields(model = %model))]
    async fn complete(&self, model: &str, instructions: &str, text: &str) -> Result<Completion> {
        let body = build_chat_request(model, instructions, text);
        let value = self.post("chat/completions", &body).await?;
        let parsed: ChatResponse =
            serde_json::from_value(value).context("unexpected chat completion shape")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("empty completion"))?;
        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        debug!(tokens, "completion received");
        Ok(Completion { text, tokens })
    }

    #[instrument(skip_all, fields(model = %request.model))]
    async fn generate_image(&self, request: &ImageRequest) -> Result<String> {
        let body = build_image_request(request);
        let value = self.post("images/generations", &body).await?;
        let parsed: ImageResponse =
            serde_json::from_value(value).context("unexpected image response shape")?;
        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no image returned"))?;
        if let Some(url) = first.url {
            return Ok(url);
        }
        if let Some(b64) = first.b64_json {
            return Ok(format!("data:image/png;base64,{}", b64));
        }
        Err(anyhow!("image response carried neither url nor data"))
    }
}

pub fn build_chat_request(model: &str, instructions: &str, text: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": instructions },
            { "role": "user", "content": text },
        ],
    })
}

pub fn build_image_request(request: &ImageRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "prompt": request.prompt,
        "size": request.size,
        "n": 1,
    });
    // Only the gpt-image family understands low/medium/high.
    if request.model.starts_with("gpt-image") {
        body["quality"] = Value::String(request.quality.clone());
    }
    body
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}
