use serde::Deserialize;

/// Normalized inbound webhook body from the WhatsApp-style provider.
/// One message per delivery; redeliveries carry the same `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppInbound {
    /// Provider-assigned message id.
    pub id: String,
    /// Sender phone number.
    pub from: String,
    pub name: Option<String>,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}
