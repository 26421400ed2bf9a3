use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use sema_core::helpers::dto::{
    ChatChannel, GatewayKind, InboundMessage, MessageContent, OutboundMessage,
};

use crate::bot::answers::verify_text;
use crate::dependencies::BotDeps;
use crate::server::dto::WhatsAppInbound;
use crate::server::error::ErrorServer;

pub async fn health() -> &'static str {
    "ok"
}

/// WhatsApp inbound deliveries. Always acknowledged: the provider redelivers
/// on non-2xx, and redelivery is already handled by the idempotency claim,
/// so an internal error is logged rather than bounced.
pub async fn whatsapp_webhook(
    State(bot_deps): State<BotDeps>,
    Json(payload): Json<WhatsAppInbound>,
) -> StatusCode {
    if let Err(e) = process_whatsapp(&bot_deps, payload).await {
        log::error!("whatsapp webhook processing failed: {}", e);
    }
    StatusCode::OK
}

async fn process_whatsapp(bot_deps: &BotDeps, payload: WhatsAppInbound) -> anyhow::Result<()> {
    let user_id = ChatChannel::WhatsApp.qualify(&payload.from);
    let display_name = payload.name.clone().unwrap_or_else(|| payload.from.clone());

    // Keyword commands first; WhatsApp has no slash-command surface.
    if let Some(text) = payload.text.as_deref() {
        if let Some(reply) = keyword_reply(bot_deps, &user_id, &display_name, text).await? {
            deliver(bot_deps, &user_id, reply).await;
            return Ok(());
        }
    }

    let content = match (payload.media_url, payload.text) {
        (Some(url), _) => MessageContent::Media {
            url,
            mime_type: payload
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            caption: payload.caption.unwrap_or_default(),
        },
        (None, Some(text)) if !text.trim().is_empty() => MessageContent::Text(text),
        _ => return Ok(()),
    };

    let inbound = InboundMessage {
        channel: ChatChannel::WhatsApp,
        user_id: user_id.clone(),
        display_name,
        message_id: payload.id,
        content,
    };

    let outcome = bot_deps.orchestrator.answer(&inbound).await?;
    if let Some(text) = outcome.user_text() {
        let reply = OutboundMessage::from((&inbound, text));
        if let Err(e) = bot_deps.transports.deliver(&reply).await {
            log::error!("whatsapp delivery to {} failed: {}", inbound.user_id, e);
        }
    }
    Ok(())
}

/// `cancel`, `balance`, `buy N [gateway]`, `verify REF` — the WhatsApp
/// equivalents of the Telegram commands. Returns `None` when the text is an
/// ordinary prompt for the orchestrator.
async fn keyword_reply(
    bot_deps: &BotDeps,
    user_id: &str,
    display_name: &str,
    text: &str,
) -> anyhow::Result<Option<String>> {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let mut words = lower.split_whitespace();

    let reply = match words.next() {
        Some("cancel") if words.next().is_none() => {
            Some(bot_deps.orchestrator.cancel_latest(user_id).user_text())
        }
        Some("balance") if words.next().is_none() => {
            let (user, _) = bot_deps.ledger.create_if_absent(user_id, display_name)?;
            Some(format!("💰 You have {} token(s).", user.token_balance))
        }
        Some("buy") => {
            let amount: Option<u64> = words.next().and_then(|a| a.parse().ok());
            let gateway = words
                .next()
                .and_then(GatewayKind::parse)
                .unwrap_or(GatewayKind::Flutterwave);
            match amount {
                Some(amount) if amount > 0 => {
                    let (user, _) = bot_deps.ledger.create_if_absent(user_id, display_name)?;
                    match bot_deps.reconciler.initiate(&user, amount * 100, gateway).await {
                        Ok(init) => Some(format!(
                            "💳 Pay here: {}\nReference: {}\nSend \"verify {}\" if tokens don't arrive.",
                            init.redirect_url, init.reference, init.reference
                        )),
                        Err(e) => {
                            log::warn!("whatsapp payment init for {} failed: {}", user_id, e);
                            Some("Couldn't start that payment, try again shortly.".to_string())
                        }
                    }
                }
                _ => Some("Usage: buy <amount>, e.g. buy 500".to_string()),
            }
        }
        Some("verify") => match trimmed.split_whitespace().nth(1) {
            Some(reference) => match bot_deps.reconciler.verify(reference).await {
                Ok(outcome) => Some(verify_text(&outcome)),
                Err(e) => {
                    log::warn!("whatsapp verify {} failed: {}", reference, e);
                    Some("Couldn't verify that reference. Check it and try again.".to_string())
                }
            },
            None => Some("Usage: verify <payment reference>".to_string()),
        },
        _ => None,
    };
    Ok(reply)
}

async fn deliver(bot_deps: &BotDeps, user_id: &str, text: String) {
    let message = OutboundMessage {
        channel: ChatChannel::WhatsApp,
        user_id: user_id.to_string(),
        text,
    };
    if let Err(e) = bot_deps.transports.deliver(&message).await {
        log::error!("whatsapp delivery to {} failed: {}", user_id, e);
    }
}

/// Gateway webhook callbacks. Acknowledged unconditionally once the gateway
/// path resolves; the reconciler logs anything that needs manual follow-up.
pub async fn payment_webhook(
    State(bot_deps): State<BotDeps>,
    Path(gateway): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<StatusCode, ErrorServer> {
    let kind = GatewayKind::parse(&gateway).ok_or(ErrorServer {
        message: format!("unknown gateway: {}", gateway),
        status: StatusCode::NOT_FOUND.as_u16(),
    })?;

    if let Some(credit) = bot_deps.reconciler.handle_webhook(kind, payload).await {
        if let Some(channel) = ChatChannel::from_user_id(&credit.user_id) {
            let notice = OutboundMessage {
                channel,
                user_id: credit.user_id.clone(),
                text: format!(
                    "✅ Payment {} confirmed, {} token(s) credited.",
                    credit.reference, credit.tokens
                ),
            };
            if let Err(e) = bot_deps.transports.deliver(&notice).await {
                log::warn!("payment notice to {} failed: {}", credit.user_id, e);
            }
        }
    }
    Ok(StatusCode::OK)
}
