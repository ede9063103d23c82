//! Publish gateway: the narrow interface to the chat platform.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, Recipient,
};
use tracing::{info, instrument, warn};

/// Inline approve / new-image / cancel buttons bound to one awaiting post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalButtons {
    pub post_id: String,
}

#[async_trait]
pub trait PublishGateway: Send + Sync {
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()>;

    /// `photo` is an http(s) URL or a `data:` URL.
    async fn send_photo(
        &self,
        target: &str,
        photo: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()>;

    async fn send_video(
        &self,
        target: &str,
        video: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".webm"];

/// Decide how to send a media URL from its file extension.
pub fn media_kind(url: &str) -> MediaKind {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("data:video/") {
        return MediaKind::Video;
    }
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    if VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        MediaKind::Video
    } else {
        MediaKind::Photo
    }
}

/// Send text with optional media, branching on the media type.
pub async fn send_content(
    gateway: &dyn PublishGateway,
    target: &str,
    text: &str,
    media: Option<&str>,
    buttons: Option<&ApprovalButtons>,
) -> Result<()> {
    match media.filter(|m| !m.trim().is_empty()) {
        Some(media) => match media_kind(media) {
            MediaKind::Video => gateway.send_video(target, media, text, buttons).await,
            MediaKind::Photo => gateway.send_photo(target, media, text, buttons).await,
        },
        None => gateway.send_text(target, text, buttons).await,
    }
}

/// Telegram Bot API implementation.
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Numeric ids address chats directly; anything else is a channel username.
pub fn recipient(target: &str) -> Recipient {
    match target.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => {
            let name = target.trim();
            if name.starts_with('@') {
                Recipient::ChannelUsername(name.to_string())
            } else {
                Recipient::ChannelUsername(format!("@{}", name))
            }
        }
    }
}

pub fn keyboard(buttons: &ApprovalButtons) -> InlineKeyboardMarkup {
    let id = &buttons.post_id;
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("Approve", format!("approve:{}", id)),
        InlineKeyboardButton::callback("Approve with new image", format!("approve_image:{}", id)),
        InlineKeyboardButton::callback("Cancel", format!("cancel:{}", id)),
    ]])
}

fn input_file(url: &str) -> Result<InputFile> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (_, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| anyhow!("unsupported data URL"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .context("invalid base64 in data URL")?;
        return Ok(InputFile::memory(bytes).file_name("image.png"));
    }
    let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid media URL {}", url))?;
    Ok(InputFile::url(parsed))
}

#[async_trait]
impl PublishGateway for TelegramGateway {
    #[instrument(skip_all, fields(target = %target))]
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()> {
        let mut req = self
            .bot
            .send_message(recipient(target), text)
            .parse_mode(ParseMode::Html);
        if let Some(b) = buttons {
            req = req.reply_markup(keyboard(b));
        }
        if let Err(err) = req.await {
            warn!(?err, "failed to send message");
            return Err(anyhow!("failed to send message to {}: {}", target, err));
        }
        info!("sent message");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target))]
    async fn send_photo(
        &self,
        target: &str,
        photo: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()> {
        let mut req = self
            .bot
            .send_photo(recipient(target), input_file(photo)?)
            .caption(caption)
            .parse_mode(ParseMode::Html);
        if let Some(b) = buttons {
            req = req.reply_markup(keyboard(b));
        }
        if let Err(err) = req.await {
            warn!(?err, "failed to send photo");
            return Err(anyhow!("failed to send photo to {}: {}", target, err));
        }
        info!("sent photo");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target))]
    async fn send_video(
        &self,
        target: &str,
        video: &str,
        caption: &str,
        buttons: Option<&ApprovalButtons>,
    ) -> Result<()> {
        let mut req = self
            .bot
            .send_video(recipient(target), input_file(video)?)
            .caption(caption)
            .parse_mode(ParseMode::Html);
        if let Some(b) = buttons {
            req = req.reply_markup(keyboard(b));
        }
        if let Err(err) = req.await {
            warn!(?err, "failed to send video");
            return Err(anyhow!("failed to send video to {}: {}", target, err));
        }
        info!("sent video");
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
            .context("failed to delete message")?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(t) = text {
            req = req.text(t);
        }
        req.await.context("failed to answer callback")?;
        Ok(())
    }
}
