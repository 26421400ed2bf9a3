use serde::{Deserialize, Serialize};
use std::fmt;

/// Which chat surface a message came from / goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatChannel {
    Telegram,
    WhatsApp,
}

impl ChatChannel {
    pub fn prefix(&self) -> &'static str {
        match self {
            ChatChannel::Telegram => "tg",
            ChatChannel::WhatsApp => "wa",
        }
    }

    /// Channel-qualified user id, unique across both surfaces.
    pub fn qualify(&self, raw_id: &str) -> String {
        format!("{}:{}", self.prefix(), raw_id)
    }

    /// Recover the channel from a qualified user id.
    pub fn from_user_id(user_id: &str) -> Option<Self> {
        match user_id.split_once(':')?.0 {
            "tg" => Some(ChatChannel::Telegram),
            "wa" => Some(ChatChannel::WhatsApp),
            _ => None,
        }
    }
}

impl fmt::Display for ChatChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Inbound payload, already normalized at the transport boundary.
///
/// Channel handlers build exactly one of these per delivery; nothing past
/// the boundary ever looks at platform-specific fields again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageContent {
    Text(String),
    Media {
        url: String,
        mime_type: String,
        caption: String,
    },
}

impl MessageContent {
    pub fn prompt_text(&self) -> &str {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Media { caption, .. } => caption,
        }
    }

    pub fn attachment_url(&self) -> Option<&str> {
        match self {
            MessageContent::Text(_) => None,
            MessageContent::Media { url, .. } => Some(url),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChatChannel,
    /// Channel-qualified user id (`tg:<id>` / `wa:<id>`).
    pub user_id: String,
    pub display_name: String,
    /// Channel-assigned message id, the idempotency key together with user_id.
    pub message_id: String,
    pub content: MessageContent,
}

impl InboundMessage {
    /// 1 token for plain text, 2 when an attachment rides along.
    pub fn token_cost(&self) -> u64 {
        match self.content {
            MessageContent::Text(_) => 1,
            MessageContent::Media { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: ChatChannel,
    pub user_id: String,
    pub text: String,
}

impl From<(&InboundMessage, String)> for OutboundMessage {
    fn from((inbound, text): (&InboundMessage, String)) -> Self {
        OutboundMessage {
            channel: inbound.channel,
            user_id: inbound.user_id.clone(),
            text,
        }
    }
}

/// Supported payment gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayKind {
    Paystack,
    Flutterwave,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Paystack => "paystack",
            GatewayKind::Flutterwave => "flutterwave",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "paystack" => Some(GatewayKind::Paystack),
            "flutterwave" => Some(GatewayKind::Flutterwave),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What `initialize` returns from either gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInit {
    pub reference: String,
    pub redirect_url: String,
}

/// What `verify` returns from either gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyStatus {
    Success { amount_minor: u64 },
    Pending,
    Failed,
}
