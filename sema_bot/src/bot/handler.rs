use anyhow::Result;
use sema_core::helpers::dto::{ChatChannel, InboundMessage, MessageContent};
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, Message},
};

use crate::dependencies::BotDeps;
use crate::orchestrator::handler::AnswerOutcome;
use crate::requests::dto::RequestRecord;

/// Plain messages (text or photo) become prompts. A placeholder with a
/// cancel button goes up immediately; the orchestrator's outcome replaces it.
pub async fn handle_message(bot: Bot, msg: Message, bot_deps: BotDeps) -> Result<()> {
    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };
    if !msg.chat.is_private() {
        return Ok(());
    }

    let user_id = ChatChannel::Telegram.qualify(&user.id.to_string());
    let message_id = msg.id.0.to_string();

    let content = match build_content(&bot, &msg, &bot_deps).await? {
        Some(content) => content,
        None => {
            bot.send_message(msg.chat.id, "I can only read text and photos right now.")
                .await?;
            return Ok(());
        }
    };

    let inbound = InboundMessage {
        channel: ChatChannel::Telegram,
        user_id: user_id.clone(),
        display_name: user.first_name.clone(),
        message_id: message_id.clone(),
        content,
    };

    // The record id is deterministic, so the cancel button can be wired up
    // before the claim even lands.
    let request_id = RequestRecord::record_id(&user_id, &message_id);

    // A known record means this delivery is a retry; the claim inside the
    // orchestrator settles duplicates, so don't even flash a placeholder.
    if bot_deps.tracker.get(&request_id).is_ok() {
        return Ok(());
    }
    let cancel_button =
        InlineKeyboardButton::callback("❌ Cancel", format!("cancel:{}", request_id));
    let placeholder = bot
        .send_message(msg.chat.id, "⏳ Thinking…")
        .reply_markup(InlineKeyboardMarkup::new(vec![vec![cancel_button]]))
        .await?;

    let outcome = match bot_deps.orchestrator.answer(&inbound).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("orchestrator failed for {}: {}", request_id, e);
            bot.edit_message_text(
                msg.chat.id,
                placeholder.id,
                "Something went wrong on my side. Please try again.",
            )
            .await?;
            return Ok(());
        }
    };

    match outcome.user_text() {
        Some(text) => {
            // Editing without a reply markup also drops the cancel button.
            bot.edit_message_text(msg.chat.id, placeholder.id, text)
                .await?;
        }
        None => {
            // Duplicate delivery or a cancellation that already answered
            // for itself; the placeholder just disappears.
            bot.delete_message(msg.chat.id, placeholder.id).await?;
        }
    }

    if let AnswerOutcome::Welcome = outcome {
        log::info!("welcomed telegram user {}", user_id);
    }
    Ok(())
}

async fn build_content(
    bot: &Bot,
    msg: &Message,
    bot_deps: &BotDeps,
) -> Result<Option<MessageContent>> {
    if let Some(photos) = msg.photo() {
        if let Some(photo) = photos.last() {
            let file = bot.get_file(photo.file.id.clone()).await?;
            let url = format!("{}/{}", bot_deps.telegram_file_base, file.path);
            return Ok(Some(MessageContent::Media {
                url,
                mime_type: "image/jpeg".to_string(),
                caption: msg.caption().unwrap_or_default().to_string(),
            }));
        }
    }
    if let Some(text) = msg.text() {
        if !text.trim().is_empty() {
            return Ok(Some(MessageContent::Text(text.to_string())));
        }
    }
    Ok(None)
}
