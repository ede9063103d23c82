#![allow(dead_code)]

use anyhow::{anyhow, Result};
use newsdesk::config::{Instance, Tenant};
use newsdesk::gateway::{ApprovalButtons, PublishGateway};
use newsdesk::llm::{Completion, ImageRequest, LanguageModel};
use newsdesk::model::{Author, EmojiMap, Filter};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text {
        target: String,
        text: String,
        buttons: Option<String>,
    },
    Photo {
        target: String,
        photo: String,
        caption: String,
        buttons: Option<String>,
    },
    Video {
        target: String,
        video: String,
        caption: String,
        buttons: Option<String>,
    },
    Deleted {
        chat_id: i64,
        message_id: i32,
    },
    Answered {
        callback_id: String,
        text: Option<String>,
    },
}

impl Sent {
    pub fn target(&self) -> Option<&str> {
        match self {
            Sent::Text { target, .. } | Sent::Photo { target, .. } | Sent::Video { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    pub fn buttons(&self) -> Option<&str> {
        match self {
            Sent::Text { buttons, .. } | Sent::Photo { buttons, .. } | Sent::Video { buttons, .. } => {
                buttons.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<Sent>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingGateway {
    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    /// Sends to `target` fail from now on.
    pub async fn fail_for(&self, target: &str) {
        self.failing.lock().await.insert(target.to_string());
    }

    /// Messages carrying approval buttons.
    pub async fn prompts(&self) -> Vec<Sent> {
        self.sent()
            .await
            .into_iter()
            .filter(|s| s.buttons().is_some())
            .collect()
    }

    /// Messages sent to `target` without buttons.
    pub async fn plain_to(&self, target: &str) -> Vec<Sent> {
        self.sent()
            .await
            .into_iter()
            .filter(|s| s.target() == Some(target) && s.buttons().is_none())
            .collect()
    }

    async fn record(&self, target: &str, sent: Sent) -> Result<()> {
        if self.failing.lock().await.contains(target) {
            return Err(anyhow!("chat not found"));
        }
        self.sent.lock().await.push(sent);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PublishGateway for RecordingGateway {
    async fn send_text(&self, target: &str, text: &str, buttons: Option<&ApprovalButtons>) -> Result<()> {
        let sent = Sent::Text {
            target: target.to_string(),
            text: text.to_string(),
            buttons: buttons.map(|b| b.post_id.clone()),
        };
        self.record(target, sent).await
    }

    async fn send_photo(
        &self,
        target: &str,
        photo: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()> {
        let sent = Sent::Photo {
            target: target.to_string(),
            photo: photo.to_string(),
            caption: caption.to_string(),
            buttons: buttons.map(|b| b.post_id.clone()),
        };
        self.record(target, sent).await
    }

    async fn send_video(
        &self,
        target: &str,
        video: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()> {
        let sent = Sent::Video {
            target: target.to_string(),
            video: video.to_string(),
            caption: caption.to_string(),
            buttons: buttons.map(|b| b.post_id.clone()),
        };
        self.record(target, sent).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.sent.lock().await.push(Sent::Deleted {
            chat_id,
            message_id,
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.sent.lock().await.push(Sent::Answered {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeLlm {
    completions: Arc<Mutex<VecDeque<Result<Completion>>>>,
    images: Arc<Mutex<VecDeque<Result<String>>>>,
    image_requests: Arc<Mutex<Vec<ImageRequest>>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeLlm {
    pub fn with_completions(texts: &[&str]) -> Self {
        let queue = texts
            .iter()
            .map(|t| {
                Ok(Completion {
                    text: t.to_string(),
                    tokens: 10,
                })
            })
            .collect();
        Self {
            completions: Arc::new(Mutex::new(queue)),
            ..Default::default()
        }
    }

    pub fn with_images(images: Vec<Result<String>>) -> Self {
        Self {
            images: Arc::new(Mutex::new(VecDeque::from(images))),
            ..Default::default()
        }
    }

    /// Image generation waits for a permit on `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub async fn fail_next_completion(&self, message: &str) {
        self.completions
            .lock()
            .await
            .push_front(Err(anyhow!(message.to_string())));
    }

    pub async fn image_requests(&self) -> Vec<ImageRequest> {
        self.image_requests.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for FakeLlm {
    async fn complete(&self, _model: &str, _instructions: &str, _text: &str) -> Result<Completion> {
        self.completions.lock().await.pop_front().unwrap_or_else(|| {
            Ok(Completion {
                text: "5".into(),
                tokens: 1,
            })
        })
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<String> {
        self.image_requests.lock().await.push(request.clone());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        self.images
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("https://img/generated.png".into()))
    }
}

pub fn instance(id: &str, approvers: &[&str]) -> Instance {
    let mut inst = Instance::new(id);
    inst.approvers = approvers.iter().map(|a| a.to_string()).collect();
    inst
}

/// `root` (instance `news` approved by Alice, instance `open` with no list)
/// and `other` (instance `misc` approved by Bob).
pub fn tenants() -> Vec<Tenant> {
    let mut emojis = EmojiMap::new();
    emojis.insert("😀".into(), "100".into());
    let mut news = instance("news", &["Alice"]);
    news.post_suffix = "via @newsdesk".into();
    vec![
        Tenant {
            login: "root".into(),
            instances: vec![news, instance("open", &[])],
            filters: vec![Filter {
                id: "relevance".into(),
                title: "Relevance".into(),
                model: "gpt-4o-mini".into(),
                instructions: "Rate 0-10".into(),
                vector_store_id: None,
                min_score: 7.0,
            }],
            authors: vec![Author {
                id: "editor".into(),
                title: "Editor".into(),
                model: "gpt-4o-mini".into(),
                instructions: "Rewrite".into(),
                vector_store_id: None,
            }],
            emojis,
        },
        Tenant {
            login: "other".into(),
            instances: vec![instance("misc", &["Bob"])],
            filters: vec![],
            authors: vec![],
            emojis: EmojiMap::new(),
        },
    ]
}
