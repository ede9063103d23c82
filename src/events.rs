//! Typed publish/subscribe channels: pipeline log lines and chat-bot events.
use crate::transform::EmojiEntity;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// One free-text status line, scoped to an instance (or global when `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub instance_id: Option<String>,
    pub message: String,
}

/// Fan-out of log lines to every live log/stream subscriber. A subscriber
/// stops receiving as soon as its receiver is dropped.
#[derive(Debug, Clone)]
pub struct LogBus {
    tx: broadcast::Sender<LogLine>,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Record a line to tracing and to current subscribers.
    pub fn log(&self, instance_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        match instance_id {
            Some(inst) => info!(instance = inst, "{}", message),
            None => info!("{}", message),
        }
        // No subscribers is fine.
        let _ = self.tx.send(LogLine {
            instance_id: instance_id.map(str::to_string),
            message,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Inline-button press on an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub callback_id: String,
    pub from_id: String,
    pub data: String,
    /// (chat id, message id) of the prompt the button belongs to.
    pub message: Option<(i64, i32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    StartApproving,
    StopApproving,
    AddEmojis,
}

impl BotCommand {
    /// Parse the leading `/command` (optionally `@botname`-suffixed).
    pub fn parse(text: &str) -> Option<Self> {
        let head = text.split_whitespace().next()?;
        let name = head.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name).to_ascii_lowercase();
        match name.as_str() {
            "start_approving" => Some(BotCommand::StartApproving),
            "stop_approving" => Some(BotCommand::StopApproving),
            "add_emojis" => Some(BotCommand::AddEmojis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub from_id: String,
    pub username: Option<String>,
    pub command: BotCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub from_id: String,
    pub text: String,
    pub custom_emojis: Vec<EmojiEntity>,
}

/// Sending halves, one channel per concern.
#[derive(Debug, Clone)]
pub struct BotEventSender {
    pub callbacks: mpsc::Sender<CallbackEvent>,
    pub commands: mpsc::Sender<CommandEvent>,
    pub messages: mpsc::Sender<MessageEvent>,
}

#[derive(Debug)]
pub struct BotEventReceiver {
    pub callbacks: mpsc::Receiver<CallbackEvent>,
    pub commands: mpsc::Receiver<CommandEvent>,
    pub messages: mpsc::Receiver<MessageEvent>,
}

pub fn bot_channels(capacity: usize) -> (BotEventSender, BotEventReceiver) {
    let (cb_tx, cb_rx) = mpsc::channel(capacity);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (msg_tx, msg_rx) = mpsc::channel(capacity);
    (
        BotEventSender {
            callbacks: cb_tx,
            commands: cmd_tx,
            messages: msg_tx,
        },
        BotEventReceiver {
            callbacks: cb_rx,
            commands: cmd_rx,
            messages: msg_rx,
        },
    )
}
