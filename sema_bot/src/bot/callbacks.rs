use anyhow::Result;
use sema_core::helpers::dto::ChatChannel;
use teloxide::prelude::*;

use crate::dependencies::BotDeps;
use crate::orchestrator::handler::CancelOutcome;

/// The only callback surface is the cancel button under a pending answer.
pub async fn handle_callback_query(
    bot: Bot,
    query: teloxide::types::CallbackQuery,
    bot_deps: BotDeps,
) -> Result<()> {
    let data = match query.data.as_deref() {
        Some(data) => data,
        None => {
            bot.answer_callback_query(query.id).await?;
            return Ok(());
        }
    };

    if let Some(request_id) = data.strip_prefix("cancel:") {
        let user_id = ChatChannel::Telegram.qualify(&query.from.id.to_string());
        let outcome = bot_deps.orchestrator.cancel(request_id, &user_id);
        let text = outcome.user_text();

        bot.answer_callback_query(query.id.clone())
            .text(text.clone())
            .await?;

        if let CancelOutcome::Cancelled { .. } = outcome {
            if let Some(message) = query.regular_message() {
                bot.edit_message_text(message.chat.id, message.id, text)
                    .await?;
            }
        }
        return Ok(());
    }

    log::debug!("ignoring unknown callback data: {}", data);
    bot.answer_callback_query(query.id).await?;
    Ok(())
}
