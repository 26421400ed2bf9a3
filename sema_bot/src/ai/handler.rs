use async_trait::async_trait;
use open_ai_rust_responses_by_sshift::types::InputItem;
use open_ai_rust_responses_by_sshift::{Client as OAIClient, Model, RecoveryPolicy, Request};
use sema_core::error::BotError;

use crate::ledger::dto::{ConversationTurn, TurnContent, TurnRole};

use super::AnswerProvider;

const SYSTEM_PROMPT: &str = "You are Sema, a concise and helpful assistant reached \
over chat. Answer in plain text suitable for a messaging app; no markdown tables.";

const MAX_OUTPUT_TOKENS: u32 = 1200;

#[derive(Clone)]
pub struct AI {
    openai_client: OAIClient,
    model: Model,
}

impl AI {
    pub fn new(openai_api_key: String) -> Self {
        // Default recovery policy retries once on transient API errors.
        let recovery_policy = RecoveryPolicy::default();
        let openai_client = OAIClient::new_with_recovery(&openai_api_key, recovery_policy)
            .expect("Failed to create OpenAI client");

        Self {
            openai_client,
            model: Model::GPT4o,
        }
    }

    fn replay_turn(turn: &ConversationTurn) -> InputItem {
        let role = match turn.role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        };
        match &turn.content {
            TurnContent::Text(text) => {
                InputItem::message(role, vec![InputItem::content_text(text)])
            }
            TurnContent::Media {
                text,
                attachment_url,
            } => {
                let mut content = vec![InputItem::content_image_with_detail(attachment_url, "low")];
                if !text.trim().is_empty() {
                    content.push(InputItem::content_text(text));
                }
                InputItem::message(role, content)
            }
        }
    }
}

#[async_trait]
impl AnswerProvider for AI {
    async fn ask(
        &self,
        history: &[ConversationTurn],
        prompt: &str,
        attachment_url: Option<&str>,
    ) -> Result<String, BotError> {
        let mut items: Vec<InputItem> = history.iter().map(Self::replay_turn).collect();

        let mut content = Vec::new();
        if let Some(url) = attachment_url {
            content.push(InputItem::content_image_with_detail(url, "high"));
        }
        if !prompt.trim().is_empty() {
            content.push(InputItem::content_text(prompt));
        }
        items.push(InputItem::message("user", content));

        let request = Request::builder()
            .model(self.model.clone())
            .instructions(SYSTEM_PROMPT.to_string())
            .input_items(items)
            .max_output_tokens(MAX_OUTPUT_TOKENS)
            .build();

        let response = self
            .openai_client
            .responses
            .create(request)
            .await
            .map_err(|e| BotError::ProviderFailure(e.to_string()))?;

        let reply = response.output_text();
        if reply.trim().is_empty() {
            return Err(BotError::ProviderFailure("empty model response".to_string()));
        }
        Ok(reply)
    }
}
