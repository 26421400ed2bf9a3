use sema_core::helpers::dto::GatewayKind;
use serde::{Deserialize, Serialize};

/// Pending transactions are treated as failed past this age.
pub const TRANSACTION_EXPIRY_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// One payment attempt, keyed by its locally generated reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub reference: String,
    pub user_id: String,
    pub amount_minor: u64,
    pub tokens: u64,
    pub gateway: GatewayKind,
    pub status: TransactionStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub completed_at: Option<i64>,
    /// Opaque gateway response kept for manual reconciliation.
    pub raw_response: Option<serde_json::Value>,
}

/// Secondary guard: "this reference already credited tokens", keyed by
/// `<user_id>:<reference>`. Written before the credit (mark-then-credit) so
/// a retry after a crash can never double-credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub user_id: String,
    pub reference: String,
    pub tokens: u64,
    pub verified_at: i64,
}

impl VerificationRecord {
    pub fn key(user_id: &str, reference: &str) -> String {
        format!("{}:{}", user_id, reference)
    }
}

/// What a verify call resolved to. All four are ordinary outcomes the user
/// can be told about, not faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Credited { tokens: u64, amount_minor: u64 },
    AlreadyCredited,
    Pending,
    Failed,
}

/// Passed back to webhook callers so the user can be notified of the credit.
#[derive(Debug, Clone)]
pub struct WebhookCredit {
    pub user_id: String,
    pub reference: String,
    pub tokens: u64,
}
