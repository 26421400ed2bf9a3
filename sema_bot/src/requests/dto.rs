use serde::{Deserialize, Serialize};

/// Request records older than this are purged by the maintenance sweep.
/// Retention is for auditability only; dedup correctness never leans on it.
pub const REQUEST_RETENTION_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Processing)
    }
}

/// One in-flight or settled "answer this message" operation. The record id
/// doubles as the idempotency key: `<user_id>:<message_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub token_cost: u64,
    pub status: RequestStatus,
    pub prompt: String,
    pub attachment_url: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

impl RequestRecord {
    pub fn record_id(user_id: &str, message_id: &str) -> String {
        format!("{}:{}", user_id, message_id)
    }
}
