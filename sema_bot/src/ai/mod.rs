pub mod handler;

use async_trait::async_trait;
use sema_core::error::BotError;

use crate::ledger::dto::ConversationTurn;

/// The external answering service: conversation + prompt in, text out.
/// May take seconds and may fail; the orchestrator owns timeouts and refunds.
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    async fn ask(
        &self,
        history: &[ConversationTurn],
        prompt: &str,
        attachment_url: Option<&str>,
    ) -> Result<String, BotError>;
}
