use thiserror::Error;

/// Everything that can go wrong while answering, billing or crediting.
///
/// The orchestrator converts any post-debit failure into a refund plus a
/// terminal `failed` record; the variants here are what the handlers show
/// (or deliberately do not show) to the user.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    /// Duplicate inbound delivery. Dropped silently, never user-visible.
    #[error("duplicate message, already claimed")]
    DuplicateMessage,

    #[error("answer provider failure: {0}")]
    ProviderFailure(String),

    /// A cancel (or complete/fail) hit a record that already reached a
    /// terminal state. Reported as a no-op, not a fault.
    #[error("request already {0}")]
    AlreadyTerminal(String),

    #[error("request belongs to another user")]
    Forbidden,

    #[error("record not found")]
    NotFound,

    #[error("payment gateway failure: {0}")]
    GatewayFailure(String),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error("corrupt stored record: {0}")]
    Codec(#[from] serde_json::Error),
}
