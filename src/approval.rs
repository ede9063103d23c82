//! Human-in-the-loop approval: awaiting posts, active approvers and the
//! transitions driven from HTTP and from bot callbacks.
//!
//! All shared maps live in [`ApprovalDesk`]. Every check-then-mutate sequence
//! runs under a single guard with no `.await` while it is held; image
//! generation releases the guard and re-checks the post afterwards.
use crate::config::{Instance, Tenant};
use crate::events::{BotCommand, BotEventReceiver, CallbackEvent, CommandEvent, LogBus, MessageEvent};
use crate::gateway::{send_content, ApprovalButtons, PublishGateway};
use crate::llm::LanguageModel;
use crate::model::{AwaitingPost, EmojiMap, PostState};
use crate::transform::{self, apply_custom_emojis, parse_emoji_pack, ImageOverrides, Rewrite, Score};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("post not found")]
    NotFound,
    #[error("no active approvers")]
    NoActiveApprovers,
    #[error("channel required")]
    MissingChannel,
    #[error("text or media required")]
    MissingContent,
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
    #[error("filter {0} not found")]
    UnknownFilter(String),
    #[error("author {0} not found")]
    UnknownAuthor(String),
    #[error("image already generating")]
    Busy,
    #[error("post {0} is already awaiting approval")]
    DuplicateId(String),
    #[error("{0}")]
    Publish(anyhow::Error),
    #[error("{0}")]
    Llm(anyhow::Error),
}

/// A request to publish content, possibly through approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub login: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Optional review stages run before a publish request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    #[serde(default)]
    pub filter_id: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum PublishOutcome {
    /// Queued for approval under `id`.
    Awaiting { id: String },
    /// No eligible approver was active, so the post went straight out.
    Published,
    /// The filter scored the text below its threshold.
    Rejected { score: f64 },
}

/// Decoded inline-button payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Approve(String),
    ApproveImage(String),
    Cancel(String),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let (action, id) = data.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match action {
            "approve" => Some(CallbackAction::Approve(id.to_string())),
            "approve_image" => Some(CallbackAction::ApproveImage(id.to_string())),
            "cancel" => Some(CallbackAction::Cancel(id.to_string())),
            _ => None,
        }
    }
}

/// Tenant data needed to render or publish one post.
struct PostContext {
    emojis: EmojiMap,
    instance: Instance,
    eligible: BTreeSet<String>,
}

/// Lower-cased approvers of every instance of one tenant.
fn tenant_approvers(tenant: &Tenant) -> BTreeSet<String> {
    tenant
        .instances
        .iter()
        .flat_map(|i| i.approvers.iter())
        .map(|a| a.to_lowercase())
        .collect()
}

fn global_approvers(tenants: &[Tenant]) -> BTreeSet<String> {
    tenants.iter().flat_map(tenant_approvers).collect()
}

/// The instance's explicit approvers, or the union over all tenants.
pub fn eligible_in(tenants: &[Tenant], login: &str, instance_id: Option<&str>) -> BTreeSet<String> {
    let explicit: BTreeSet<String> = tenants
        .iter()
        .find(|t| t.login == login)
        .zip(instance_id)
        .and_then(|(t, id)| t.instance(id))
        .map(|inst| inst.approvers.iter().map(|a| a.to_lowercase()).collect())
        .unwrap_or_default();
    if explicit.is_empty() {
        global_approvers(tenants)
    } else {
        explicit
    }
}

fn prompt_text(channel: &str, text: &str, emojis: &EmojiMap) -> String {
    let sub = apply_custom_emojis(text, emojis);
    let mut out = format!("Approve post to {}?\n{}", channel, sub.text);
    if !sub.replaced.is_empty() {
        out.push_str(&format!("\nReplaced: {}", sub.replaced.join(", ")));
    }
    out
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

pub struct ApprovalDesk {
    tenants: RwLock<Vec<Tenant>>,
    awaiting: Mutex<HashMap<String, AwaitingPost>>,
    /// Bot user id -> lower-cased handle.
    active: Mutex<BTreeMap<String, String>>,
    /// Bot user id -> tenant logins armed by `/add_emojis`.
    pending_emojis: Mutex<HashMap<String, Vec<String>>>,
    gateway: Arc<dyn PublishGateway>,
    llm: Arc<dyn LanguageModel>,
    logs: LogBus,
}

impl ApprovalDesk {
    pub fn new(
        tenants: Vec<Tenant>,
        gateway: Arc<dyn PublishGateway>,
        llm: Arc<dyn LanguageModel>,
        logs: LogBus,
    ) -> Self {
        Self {
            tenants: RwLock::new(tenants),
            awaiting: Mutex::new(HashMap::new()),
            active: Mutex::new(BTreeMap::new()),
            pending_emojis: Mutex::new(HashMap::new()),
            gateway,
            llm,
            logs,
        }
    }

    pub fn logs(&self) -> &LogBus {
        &self.logs
    }

    pub async fn eligible_approvers(&self, login: &str, instance_id: Option<&str>) -> BTreeSet<String> {
        let tenants = self.tenants.read().await;
        eligible_in(&tenants, login, instance_id)
    }

    /// Active approver user ids whose handle is in `eligible`.
    pub async fn targets(&self, eligible: &BTreeSet<String>) -> Vec<String> {
        self.active
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| eligible.contains(*handle))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn active_approvers(&self) -> BTreeMap<String, String> {
        self.active.lock().await.clone()
    }

    pub async fn emojis(&self, login: &str) -> Option<EmojiMap> {
        let tenants = self.tenants.read().await;
        tenants.iter().find(|t| t.login == login).map(|t| t.emojis.clone())
    }

    async fn context(&self, login: &str, instance_id: Option<&str>) -> Option<PostContext> {
        let tenants = self.tenants.read().await;
        let tenant = tenants.iter().find(|t| t.login == login)?;
        let instance = instance_id
            .and_then(|id| tenant.instance(id))
            .cloned()
            .unwrap_or_else(|| Instance::new(instance_id.unwrap_or_default()));
        Some(PostContext {
            emojis: tenant.emojis.clone(),
            instance,
            eligible: eligible_in(&tenants, login, instance_id),
        })
    }

    /// Queue content for approval, or publish it at once when no eligible
    /// approver is active.
    #[instrument(skip_all, fields(login = %req.login, channel = %req.channel))]
    pub async fn publish_request(&self, req: PublishRequest) -> Result<PublishOutcome, ApprovalError> {
        if req.channel.trim().is_empty() {
            return Err(ApprovalError::MissingChannel);
        }
        if is_blank(req.text.as_deref()) && is_blank(req.media.as_deref()) {
            return Err(ApprovalError::MissingContent);
        }
        let instance_id = req.instance_id.as_deref();
        let ctx = self
            .context(&req.login, instance_id)
            .await
            .ok_or_else(|| ApprovalError::UnknownTenant(req.login.clone()))?;
        if self.active.lock().await.is_empty() {
            self.logs.log(instance_id, "Rejected post: no active approvers");
            return Err(ApprovalError::NoActiveApprovers);
        }

        let post = AwaitingPost {
            id: req.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            channel: req.channel.trim().to_string(),
            text: req.text.unwrap_or_default(),
            media: req.media.filter(|m| !m.trim().is_empty()),
            instance_id: req.instance_id.clone(),
            login: req.login.clone(),
            state: PostState::Queued,
            created_at: Utc::now(),
        };

        let targets = self.targets(&ctx.eligible).await;
        if targets.is_empty() {
            info!("no eligible approver active; publishing directly");
            self.publish_with(&post, &ctx).await?;
            return Ok(PublishOutcome::Published);
        }

        let id = post.id.clone();
        match self.awaiting.lock().await.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ApprovalError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(post.clone());
            }
        }
        self.logs.log(instance_id, format!("Queued post {} for approval", id));
        self.send_prompts(&post, &ctx, &targets).await;
        Ok(PublishOutcome::Awaiting { id })
    }

    /// Filter, then rewrite, then publish. Any stage error stops the run.
    pub async fn submit_reviewed(
        &self,
        mut req: PublishRequest,
        review: Review,
    ) -> Result<PublishOutcome, ApprovalError> {
        let reviewed = review.filter_id.is_some() || review.author_id.is_some();
        if reviewed && is_blank(req.text.as_deref()) {
            return Err(ApprovalError::MissingContent);
        }
        if let Some(filter_id) = review.filter_id.as_deref() {
            let text = req.text.clone().unwrap_or_default();
            let score = self.evaluate_filter(&req.login, filter_id, &text).await?;
            let passed = self.filter_passes(&req.login, filter_id, &score).await;
            self.logs.log(
                req.instance_id.as_deref(),
                format!("Filter {} scored {}", filter_id, score.value),
            );
            if !passed {
                return Ok(PublishOutcome::Rejected { score: score.value });
            }
        }
        if let Some(author_id) = review.author_id.as_deref() {
            let text = req.text.clone().unwrap_or_default();
            let rewritten = self.rewrite_with_author(&req.login, author_id, &text).await?;
            req.text = Some(rewritten.text);
        }
        self.publish_request(req).await
    }

    async fn filter_passes(&self, login: &str, filter_id: &str, score: &Score) -> bool {
        let tenants = self.tenants.read().await;
        tenants
            .iter()
            .find(|t| t.login == login)
            .and_then(|t| t.filter(filter_id))
            .map_or(false, |f| score.passes(f))
    }

    pub async fn evaluate_filter(&self, login: &str, filter_id: &str, text: &str) -> Result<Score, ApprovalError> {
        let filter = {
            let tenants = self.tenants.read().await;
            let tenant = tenants
                .iter()
                .find(|t| t.login == login)
                .ok_or_else(|| ApprovalError::UnknownTenant(login.to_string()))?;
            tenant
                .filter(filter_id)
                .cloned()
                .ok_or_else(|| ApprovalError::UnknownFilter(filter_id.to_string()))?
        };
        transform::score(self.llm.as_ref(), &filter, text)
            .await
            .map_err(ApprovalError::Llm)
    }

    pub async fn rewrite_with_author(&self, login: &str, author_id: &str, text: &str) -> Result<Rewrite, ApprovalError> {
        let author = {
            let tenants = self.tenants.read().await;
            let tenant = tenants
                .iter()
                .find(|t| t.login == login)
                .ok_or_else(|| ApprovalError::UnknownTenant(login.to_string()))?;
            tenant
                .author(author_id)
                .cloned()
                .ok_or_else(|| ApprovalError::UnknownAuthor(author_id.to_string()))?
        };
        transform::rewrite(self.llm.as_ref(), &author, text)
            .await
            .map_err(ApprovalError::Llm)
    }

    /// Awaiting posts, oldest first.
    pub async fn list_awaiting(&self) -> Vec<AwaitingPost> {
        let mut posts: Vec<AwaitingPost> = self.awaiting.lock().await.values().cloned().collect();
        posts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        posts
    }

    pub async fn get(&self, id: &str) -> Option<AwaitingPost> {
        self.awaiting.lock().await.get(id).cloned()
    }

    pub async fn approve(&self, id: &str) -> Result<(), ApprovalError> {
        let post = self
            .awaiting
            .lock()
            .await
            .remove(id)
            .ok_or(ApprovalError::NotFound)?;
        self.publish_post(&post).await
    }

    pub async fn cancel(&self, id: &str) -> Result<(), ApprovalError> {
        let post = self
            .awaiting
            .lock()
            .await
            .remove(id)
            .ok_or(ApprovalError::NotFound)?;
        self.logs
            .log(post.instance_id.as_deref(), format!("Cancelled post {}", id));
        Ok(())
    }

    /// Generate a new image for an awaiting post and re-send its prompts.
    /// On failure the post returns to `Queued` with its original media.
    #[instrument(skip(self, overrides))]
    pub async fn request_image(&self, id: &str, overrides: &ImageOverrides) -> Result<AwaitingPost, ApprovalError> {
        let post = {
            let mut awaiting = self.awaiting.lock().await;
            let post = awaiting.get_mut(id).ok_or(ApprovalError::NotFound)?;
            if post.state == PostState::ImageRequested {
                return Err(ApprovalError::Busy);
            }
            post.state = PostState::ImageRequested;
            post.clone()
        };
        let instance_id = post.instance_id.as_deref();
        let ctx = self.context(&post.login, instance_id).await;
        let instance = ctx
            .as_ref()
            .map(|c| c.instance.clone())
            .unwrap_or_else(|| Instance::new(instance_id.unwrap_or_default()));
        let request = transform::image_request(&instance, overrides, &post.text);

        self.logs
            .log(instance_id, format!("Generating image for post {}", id));
        let generated = self.llm.generate_image(&request).await;

        let updated = {
            let mut awaiting = self.awaiting.lock().await;
            match generated {
                Ok(url) => match awaiting.get_mut(id) {
                    Some(entry) => {
                        entry.media = Some(url);
                        entry.state = PostState::Queued;
                        entry.clone()
                    }
                    None => {
                        debug!("post left the queue while its image was generating");
                        return Err(ApprovalError::NotFound);
                    }
                },
                Err(err) => {
                    if let Some(entry) = awaiting.get_mut(id) {
                        entry.state = PostState::Queued;
                    }
                    drop(awaiting);
                    self.logs.log(
                        instance_id,
                        format!("Failed generating image for post {}: {:#}", id, err),
                    );
                    return Err(ApprovalError::Llm(err));
                }
            }
        };

        self.logs
            .log(instance_id, format!("Generated image for post {}", id));
        if let Some(ctx) = ctx {
            let targets = self.targets(&ctx.eligible).await;
            self.send_prompts(&updated, &ctx, &targets).await;
        }
        Ok(updated)
    }

    async fn send_prompts(&self, post: &AwaitingPost, ctx: &PostContext, targets: &[String]) {
        let text = prompt_text(&post.channel, &post.text, &ctx.emojis);
        let buttons = ApprovalButtons {
            post_id: post.id.clone(),
        };
        for target in targets {
            if let Err(err) = send_content(
                self.gateway.as_ref(),
                target,
                &text,
                post.media.as_deref(),
                Some(&buttons),
            )
            .await
            {
                warn!(?err, target = %target, post = %post.id, "failed to send approval prompt");
            }
        }
    }

    /// Shared publish routine for approved and directly published posts.
    pub async fn publish_post(&self, post: &AwaitingPost) -> Result<(), ApprovalError> {
        let ctx = match self.context(&post.login, post.instance_id.as_deref()).await {
            Some(ctx) => ctx,
            None => PostContext {
                emojis: EmojiMap::new(),
                instance: Instance::new(post.instance_id.clone().unwrap_or_default()),
                eligible: BTreeSet::new(),
            },
        };
        self.publish_with(post, &ctx).await
    }

    async fn publish_with(&self, post: &AwaitingPost, ctx: &PostContext) -> Result<(), ApprovalError> {
        if post.media.is_none() && post.text.trim().is_empty() {
            return Err(ApprovalError::MissingContent);
        }
        let mut text = apply_custom_emojis(&post.text, &ctx.emojis).text;
        let suffix = ctx.instance.post_suffix.trim();
        if !suffix.is_empty() {
            if text.is_empty() {
                text = suffix.to_string();
            } else {
                text = format!("{}\n\n{}", text, suffix);
            }
        }
        let instance_id = post.instance_id.as_deref();
        match send_content(
            self.gateway.as_ref(),
            &post.channel,
            &text,
            post.media.as_deref(),
            None,
        )
        .await
        {
            Ok(()) => {
                self.logs
                    .log(instance_id, format!("Published post to {}", post.channel));
                Ok(())
            }
            Err(err) => {
                self.logs.log(
                    instance_id,
                    format!("Failed to publish post to {}: {:#}", post.channel, err),
                );
                Err(ApprovalError::Publish(err))
            }
        }
    }

    async fn notify(&self, user_id: &str, text: &str) {
        if let Err(err) = self.gateway.send_text(user_id, text, None).await {
            warn!(?err, user = %user_id, "failed to notify user");
        }
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>) {
        if let Err(err) = self.gateway.answer_callback(callback_id, text).await {
            warn!(?err, "failed to answer callback");
        }
    }

    async fn delete_prompt(&self, message: Option<(i64, i32)>) {
        if let Some((chat_id, message_id)) = message {
            if let Err(err) = self.gateway.delete_message(chat_id, message_id).await {
                debug!(?err, "failed to delete approval prompt");
            }
        }
    }

    /// Handle an inline-button press on an approval prompt.
    #[instrument(skip_all, fields(data = %ev.data))]
    pub async fn handle_callback(&self, ev: CallbackEvent) {
        let Some(action) = CallbackAction::parse(&ev.data) else {
            self.answer(&ev.callback_id, None).await;
            self.delete_prompt(ev.message).await;
            return;
        };
        match action {
            CallbackAction::Approve(id) => {
                let reply = match self.approve(&id).await {
                    Ok(()) => "Approved",
                    Err(ApprovalError::NotFound) => "Post not found",
                    Err(err) => {
                        warn!(?err, post = %id, "approved post failed to publish");
                        "Failed to post"
                    }
                };
                self.answer(&ev.callback_id, Some(reply)).await;
                self.delete_prompt(ev.message).await;
            }
            CallbackAction::Cancel(id) => {
                let reply = match self.cancel(&id).await {
                    Ok(()) => "Cancelled",
                    Err(_) => "Post not found",
                };
                self.answer(&ev.callback_id, Some(reply)).await;
                self.delete_prompt(ev.message).await;
            }
            CallbackAction::ApproveImage(id) => {
                self.delete_prompt(ev.message).await;
                if self.get(&id).await.is_none() {
                    self.answer(&ev.callback_id, Some("Post not found")).await;
                    return;
                }
                self.answer(&ev.callback_id, Some("Generating image...")).await;
                self.notify(&ev.from_id, "Generating image...").await;
                match self.request_image(&id, &ImageOverrides::default()).await {
                    Ok(_) | Err(ApprovalError::NotFound) => {}
                    Err(ApprovalError::Busy) => {
                        self.notify(&ev.from_id, "Image is already being generated.").await;
                    }
                    Err(err) => {
                        warn!(?err, post = %id, "image generation failed");
                        self.notify(&ev.from_id, "Failed to generate image.").await;
                    }
                }
            }
        }
    }

    pub async fn start_approving(&self, user_id: &str, username: Option<&str>) -> bool {
        let handle = username.unwrap_or_default().to_lowercase();
        let allowed = {
            let tenants = self.tenants.read().await;
            !handle.is_empty() && global_approvers(&tenants).contains(&handle)
        };
        if allowed {
            self.active
                .lock()
                .await
                .insert(user_id.to_string(), handle.clone());
            self.logs.log(None, format!("Approver {} is now active", handle));
            self.notify(user_id, "You will now receive approval requests.").await;
        } else {
            self.notify(user_id, "You are not an approver.").await;
        }
        allowed
    }

    pub async fn stop_approving(&self, user_id: &str) -> bool {
        let removed = self.active.lock().await.remove(user_id);
        match removed {
            Some(handle) => {
                self.logs.log(None, format!("Approver {} stopped approving", handle));
                self.notify(user_id, "You will no longer receive approval requests.")
                    .await;
                true
            }
            None => {
                self.notify(user_id, "You are not approving.").await;
                false
            }
        }
    }

    /// Arm the emoji-pack flow for every tenant where the sender approves.
    pub async fn add_emojis(&self, user_id: &str, username: Option<&str>) -> bool {
        let handle = username.unwrap_or_default().to_lowercase();
        let logins: Vec<String> = {
            let tenants = self.tenants.read().await;
            tenants
                .iter()
                .filter(|t| !handle.is_empty() && tenant_approvers(t).contains(&handle))
                .map(|t| t.login.clone())
                .collect()
        };
        if logins.is_empty() {
            self.notify(user_id, "You are not an approver.").await;
            return false;
        }
        self.pending_emojis
            .lock()
            .await
            .insert(user_id.to_string(), logins);
        self.notify(user_id, "Send emoji pack").await;
        true
    }

    /// Consume a pending emoji pack from `ev`. Returns the number of
    /// entries merged across tenants.
    pub async fn handle_message(&self, ev: MessageEvent) -> usize {
        if ev.text.trim().is_empty() {
            return 0;
        }
        let Some(logins) = self.pending_emojis.lock().await.remove(&ev.from_id) else {
            return 0;
        };
        let pack = parse_emoji_pack(&ev.text, &ev.custom_emojis);
        let mut added = 0;
        {
            let mut tenants = self.tenants.write().await;
            for tenant in tenants.iter_mut().filter(|t| logins.contains(&t.login)) {
                for (emoji, id) in &pack {
                    if !emoji.is_empty() && !id.is_empty() {
                        tenant.emojis.insert(emoji.clone(), id.clone());
                        added += 1;
                    }
                }
            }
        }
        let reply = if added > 0 {
            format!("Added {} custom emojis.", added)
        } else {
            "No emojis added.".to_string()
        };
        self.notify(&ev.from_id, &reply).await;
        added
    }

    pub async fn handle_command(&self, ev: CommandEvent) {
        match ev.command {
            BotCommand::StartApproving => {
                self.start_approving(&ev.from_id, ev.username.as_deref()).await;
            }
            BotCommand::StopApproving => {
                self.stop_approving(&ev.from_id).await;
            }
            BotCommand::AddEmojis => {
                self.add_emojis(&ev.from_id, ev.username.as_deref()).await;
            }
        }
    }

    /// Consume bot events until every sender is gone. Callbacks run on their
    /// own tasks so image generation does not stall other approvers.
    pub async fn run(self: Arc<Self>, mut events: BotEventReceiver) {
        loop {
            tokio::select! {
                Some(ev) = events.callbacks.recv() => {
                    let desk = Arc::clone(&self);
                    tokio::spawn(async move { desk.handle_callback(ev).await });
                }
                Some(ev) = events.commands.recv() => self.handle_command(ev).await,
                Some(ev) = events.messages.recv() => {
                    self.handle_message(ev).await;
                }
                else => break,
            }
        }
        info!("bot event channels closed");
    }
}
