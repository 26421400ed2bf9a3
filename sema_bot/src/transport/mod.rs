use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use sema_core::helpers::dto::{ChatChannel, OutboundMessage};
use serde_json::json;
use teloxide::prelude::*;

/// Outbound half of a messaging transport. Channel-specific splitting and
/// escaping live behind this trait; callers hand over plain text only.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

pub struct TelegramSender {
    bot: Bot,
}

impl TelegramSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl OutboundSender for TelegramSender {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let raw_id = message
            .user_id
            .strip_prefix("tg:")
            .ok_or_else(|| anyhow!("not a telegram user id: {}", message.user_id))?;
        let chat_id: i64 = raw_id.parse()?;
        self.bot
            .send_message(ChatId(chat_id), &message.text)
            .await?;
        Ok(())
    }
}

/// WhatsApp-style HTTP API client. POSTs plain-text messages to the
/// provider's `/messages` endpoint with bearer auth.
pub struct WhatsAppSender {
    client: Client,
    api_url: String,
    api_token: String,
}

impl WhatsAppSender {
    pub fn new(api_url: String, api_token: String) -> Self {
        Self {
            client: Client::new(),
            api_url,
            api_token,
        }
    }
}

#[async_trait]
impl OutboundSender for WhatsAppSender {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let raw_id = message
            .user_id
            .strip_prefix("wa:")
            .ok_or_else(|| anyhow!("not a whatsapp user id: {}", message.user_id))?;
        let url = format!("{}/messages", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .json(&json!({ "to": raw_id, "type": "text", "text": { "body": message.text } }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable body".to_string());
            log::error!("whatsapp send failed ({}): {}", status, body);
            return Err(anyhow!("whatsapp send failed with status {}", status));
        }
        Ok(())
    }
}

/// Channel fan-out used by the orchestrator, streak reminders and payment
/// notices.
#[derive(Clone)]
pub struct Transports {
    telegram: Arc<dyn OutboundSender>,
    whatsapp: Arc<dyn OutboundSender>,
}

impl Transports {
    pub fn new(telegram: Arc<dyn OutboundSender>, whatsapp: Arc<dyn OutboundSender>) -> Self {
        Self { telegram, whatsapp }
    }

    pub async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        match message.channel {
            ChatChannel::Telegram => self.telegram.send(message).await,
            ChatChannel::WhatsApp => self.whatsapp.send(message).await,
        }
    }
}
