use async_trait::async_trait;
use reqwest::Client;
use sema_core::error::BotError;
use sema_core::helpers::dto::{GatewayKind, PaymentInit, VerifyStatus};
use serde::Deserialize;
use serde_json::json;

/// Contract both gateways satisfy: initialize an intent for a known
/// reference, verify an intent by reference. Amounts are minor units.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    async fn initialize(
        &self,
        reference: &str,
        email: &str,
        amount_minor: u64,
        callback_url: &str,
    ) -> Result<PaymentInit, BotError>;

    async fn verify(&self, reference: &str) -> Result<VerifyStatus, BotError>;
}

#[derive(Deserialize)]
struct PaystackEnvelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct PaystackInitData {
    authorization_url: String,
}

#[derive(Deserialize)]
struct PaystackVerifyData {
    status: String,
    amount: u64,
}

pub struct PaystackGateway {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl PaystackGateway {
    pub fn new(secret_key: String) -> Self {
        Self::with_base_url(secret_key, "https://api.paystack.co".to_string())
    }

    pub fn with_base_url(secret_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            secret_key,
            base_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Paystack
    }

    async fn initialize(
        &self,
        reference: &str,
        email: &str,
        amount_minor: u64,
        callback_url: &str,
    ) -> Result<PaymentInit, BotError> {
        let url = format!("{}/transaction/initialize", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .json(&json!({
                "reference": reference,
                "email": email,
                "amount": amount_minor,
                "callback_url": callback_url,
            }))
            .send()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("paystack initialize {} for {}: {}", status, reference, body);
            return Err(BotError::GatewayFailure(format!(
                "paystack initialize returned {}",
                status
            )));
        }

        let envelope: PaystackEnvelope<PaystackInitData> = response
            .json()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;
        match envelope.data {
            Some(data) if envelope.status => Ok(PaymentInit {
                reference: reference.to_string(),
                redirect_url: data.authorization_url,
            }),
            _ => Err(BotError::GatewayFailure(
                envelope
                    .message
                    .unwrap_or_else(|| "paystack rejected initialization".to_string()),
            )),
        }
    }

    async fn verify(&self, reference: &str) -> Result<VerifyStatus, BotError> {
        let url = format!("{}/transaction/verify/{}", self.base_url, reference);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .send()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(VerifyStatus::Failed);
        }
        if !response.status().is_success() {
            return Err(BotError::GatewayFailure(format!(
                "paystack verify returned {}",
                response.status()
            )));
        }

        let envelope: PaystackEnvelope<PaystackVerifyData> = response
            .json()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;
        let data = envelope
            .data
            .ok_or_else(|| BotError::GatewayFailure("paystack verify had no data".to_string()))?;
        Ok(match data.status.as_str() {
            "success" => VerifyStatus::Success {
                amount_minor: data.amount,
            },
            "abandoned" | "pending" | "ongoing" => VerifyStatus::Pending,
            _ => VerifyStatus::Failed,
        })
    }
}

#[derive(Deserialize)]
struct FlutterwaveEnvelope<T> {
    status: String,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct FlutterwaveInitData {
    link: String,
}

#[derive(Deserialize)]
struct FlutterwaveVerifyData {
    status: String,
    /// Major units in Flutterwave responses.
    amount: f64,
}

pub struct FlutterwaveGateway {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl FlutterwaveGateway {
    pub fn new(secret_key: String) -> Self {
        Self::with_base_url(secret_key, "https://api.flutterwave.com".to_string())
    }

    pub fn with_base_url(secret_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            secret_key,
            base_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for FlutterwaveGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Flutterwave
    }

    async fn initialize(
        &self,
        reference: &str,
        email: &str,
        amount_minor: u64,
        callback_url: &str,
    ) -> Result<PaymentInit, BotError> {
        let url = format!("{}/v3/payments", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .json(&json!({
                "tx_ref": reference,
                "amount": amount_minor as f64 / 100.0,
                "redirect_url": callback_url,
                "customer": { "email": email },
            }))
            .send()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BotError::GatewayFailure(format!(
                "flutterwave initialize returned {}",
                response.status()
            )));
        }

        let envelope: FlutterwaveEnvelope<FlutterwaveInitData> = response
            .json()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;
        match envelope.data {
            Some(data) if envelope.status == "success" => Ok(PaymentInit {
                reference: reference.to_string(),
                redirect_url: data.link,
            }),
            _ => Err(BotError::GatewayFailure(
                envelope
                    .message
                    .unwrap_or_else(|| "flutterwave rejected initialization".to_string()),
            )),
        }
    }

    async fn verify(&self, reference: &str) -> Result<VerifyStatus, BotError> {
        let url = format!(
            "{}/v3/transactions/verify_by_reference?tx_ref={}",
            self.base_url, reference
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .send()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(VerifyStatus::Failed);
        }
        if !response.status().is_success() {
            return Err(BotError::GatewayFailure(format!(
                "flutterwave verify returned {}",
                response.status()
            )));
        }

        let envelope: FlutterwaveEnvelope<FlutterwaveVerifyData> = response
            .json()
            .await
            .map_err(|e| BotError::GatewayFailure(e.to_string()))?;
        let data = envelope.data.ok_or_else(|| {
            BotError::GatewayFailure("flutterwave verify had no data".to_string())
        })?;
        Ok(match data.status.as_str() {
            "successful" => VerifyStatus::Success {
                amount_minor: (data.amount * 100.0).round() as u64,
            },
            "pending" => VerifyStatus::Pending,
            _ => VerifyStatus::Failed,
        })
    }
}
