use anyhow::Result;
use sema_core::helpers::bot_commands::Command;
use sema_core::helpers::dto::{ChatChannel, GatewayKind};
use teloxide::{prelude::*, types::Message, utils::command::BotCommands};

use crate::dependencies::BotDeps;
use crate::payments::dto::VerifyOutcome;

pub async fn answers(bot: Bot, msg: Message, cmd: Command, bot_deps: BotDeps) -> Result<()> {
    let from = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };
    let user_id = ChatChannel::Telegram.qualify(&from.id.to_string());

    match cmd {
        Command::Start => {
            let (_, created) = bot_deps
                .ledger
                .create_if_absent(&user_id, &from.first_name)?;
            let text = if created {
                "👋 Welcome to Sema! Ask me anything and I'll answer.\n\n\
                 Every text question costs 1 token, questions with a photo cost 2. \
                 You start with a free grant; check /balance, top up with /buy."
            } else {
                "You're all set. Just send me a question!"
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
        Command::Balance => {
            let text = match bot_deps.ledger.get(&user_id)? {
                Some(user) => format!("💰 You have {} token(s).", user.token_balance),
                None => "Send /start first to set up your account.".to_string(),
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Command::NewChat => {
            let title = format!("Chat up to {}", chrono::Utc::now().format("%Y-%m-%d %H:%M"));
            match bot_deps.ledger.archive_conversation(&user_id, &title) {
                Ok(0) => {
                    bot.send_message(msg.chat.id, "Nothing to archive; your chat is fresh.")
                        .await?;
                }
                Ok(turns) => {
                    bot.send_message(
                        msg.chat.id,
                        format!("🗂 Archived {} turn(s). Starting fresh!", turns),
                    )
                    .await?;
                }
                Err(e) => {
                    log::error!("archive for {} failed: {}", user_id, e);
                    bot.send_message(msg.chat.id, "Couldn't archive right now, try again.")
                        .await?;
                }
            }
        }
        Command::Streak => {
            let text = match bot_deps.ledger.get(&user_id)? {
                Some(user) if user.streak_count > 0 => format!(
                    "🔥 {}-day streak! Message me every day to keep it going; every 7th day earns bonus tokens.",
                    user.streak_count
                ),
                Some(_) => "No streak yet. Send a message today to start one!".to_string(),
                None => "Send /start first to set up your account.".to_string(),
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Command::Buy(args) => {
            handle_buy(&bot, &msg, &user_id, &args, &bot_deps).await?;
        }
        Command::Verify(reference) => {
            let reference = reference.trim();
            if reference.is_empty() {
                bot.send_message(msg.chat.id, "Usage: /verify <payment reference>")
                    .await?;
                return Ok(());
            }
            let text = match bot_deps.reconciler.verify(reference).await {
                Ok(outcome) => verify_text(&outcome),
                Err(e) => {
                    log::warn!("verify {} failed: {}", reference, e);
                    "Couldn't verify that reference. Check it and try again.".to_string()
                }
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Command::Email(address) => {
            let address = address.trim();
            if !address.contains('@') || address.contains(' ') {
                bot.send_message(msg.chat.id, "That doesn't look like an email. Usage: /email you@example.com")
                    .await?;
                return Ok(());
            }
            bot_deps.ledger.set_email(&user_id, address)?;
            bot.send_message(
                msg.chat.id,
                "📧 Saved. Payment receipts will go to that address.",
            )
            .await?;
        }
    }
    Ok(())
}

async fn handle_buy(
    bot: &Bot,
    msg: &Message,
    user_id: &str,
    args: &str,
    bot_deps: &BotDeps,
) -> Result<()> {
    let mut parts = args.split_whitespace();
    let amount: Option<u64> = parts.next().and_then(|a| a.parse().ok());
    let gateway = parts
        .next()
        .and_then(GatewayKind::parse)
        .unwrap_or(GatewayKind::Paystack);

    let amount = match amount {
        Some(amount) if amount > 0 => amount,
        _ => {
            bot.send_message(
                msg.chat.id,
                "Usage: /buy <amount> [paystack|flutterwave], e.g. /buy 500",
            )
            .await?;
            return Ok(());
        }
    };

    let user = match bot_deps.ledger.get(user_id)? {
        Some(user) => user,
        None => {
            bot.send_message(msg.chat.id, "Send /start first to set up your account.")
                .await?;
            return Ok(());
        }
    };

    // Amounts are entered in major units, billed in minor units.
    match bot_deps
        .reconciler
        .initiate(&user, amount * 100, gateway)
        .await
    {
        Ok(init) => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "💳 Pay here:\n{}\n\nReference: {}\nAfter paying, tokens land automatically; \
                     if they don't, run /verify {}",
                    init.redirect_url, init.reference, init.reference
                ),
            )
            .await?;
        }
        Err(e) => {
            log::warn!("payment initiation for {} failed: {}", user_id, e);
            bot.send_message(
                msg.chat.id,
                "Couldn't start that payment, please try again in a moment.",
            )
            .await?;
        }
    }
    Ok(())
}

pub fn verify_text(outcome: &VerifyOutcome) -> String {
    match outcome {
        VerifyOutcome::Credited { tokens, .. } => {
            format!("✅ Payment confirmed, {} token(s) credited.", tokens)
        }
        VerifyOutcome::AlreadyCredited => {
            "Already verified; those tokens were credited earlier.".to_string()
        }
        VerifyOutcome::Pending => {
            "Still pending with the payment provider. Try again shortly.".to_string()
        }
        VerifyOutcome::Failed => "That payment didn't go through; no tokens were credited.".to_string(),
    }
}
