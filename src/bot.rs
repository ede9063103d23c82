//! Telegram update adapter: turns messages and button presses into typed bot
//! events for the approval desk.
use crate::events::{BotCommand, BotEventSender, CallbackEvent, CommandEvent, MessageEvent};
use crate::transform::EmojiEntity;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{BotCommand as MenuCommand, MessageEntityKind, Update};
use tracing::{info, instrument, warn};

/// A text message is either a known command or free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(CommandEvent),
    Message(MessageEvent),
}

pub fn classify(
    from_id: String,
    username: Option<String>,
    text: &str,
    custom_emojis: Vec<EmojiEntity>,
) -> Inbound {
    match BotCommand::parse(text) {
        Some(command) => Inbound::Command(CommandEvent {
            from_id,
            username,
            command,
        }),
        None => Inbound::Message(MessageEvent {
            from_id,
            text: text.to_string(),
            custom_emojis,
        }),
    }
}

fn custom_emojis(msg: &Message) -> Vec<EmojiEntity> {
    msg.entities()
        .unwrap_or_default()
        .iter()
        .filter_map(|e| match &e.kind {
            MessageEntityKind::CustomEmoji { custom_emoji_id } => Some(EmojiEntity {
                offset: e.offset,
                custom_emoji_id: custom_emoji_id.to_string(),
            }),
            _ => None,
        })
        .collect()
}

#[instrument(skip_all)]
async fn on_message(msg: Message, events: BotEventSender) -> ResponseResult<()> {
    let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
        return Ok(());
    };
    let inbound = classify(
        user.id.0.to_string(),
        user.username.clone(),
        text,
        custom_emojis(&msg),
    );
    let sent = match inbound {
        Inbound::Command(ev) => events.commands.send(ev).await.is_ok(),
        Inbound::Message(ev) => events.messages.send(ev).await.is_ok(),
    };
    if !sent {
        warn!("bot event consumer is gone");
    }
    Ok(())
}

#[instrument(skip_all)]
async fn on_callback(q: CallbackQuery, events: BotEventSender) -> ResponseResult<()> {
    let ev = CallbackEvent {
        callback_id: q.id.clone(),
        from_id: q.from.id.0.to_string(),
        data: q.data.clone().unwrap_or_default(),
        message: q.message.as_ref().map(|m| (m.chat.id.0, m.id.0)),
    };
    if events.callbacks.send(ev).await.is_err() {
        warn!("bot event consumer is gone");
    }
    Ok(())
}

/// Register the command menu and dispatch updates until Ctrl-C.
pub async fn run(bot: Bot, events: BotEventSender) {
    let menu = vec![
        MenuCommand::new("start_approving", "Receive approval requests"),
        MenuCommand::new("stop_approving", "Stop receiving approval requests"),
        MenuCommand::new("add_emojis", "Upload custom emojis"),
    ];
    if let Err(err) = bot.set_my_commands(menu).await {
        warn!(?err, "failed to register bot commands");
    }

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    info!("starting telegram dispatcher");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![events])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
