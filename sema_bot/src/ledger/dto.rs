use serde::{Deserialize, Serialize};

/// Tokens granted to a brand-new account.
pub const STARTING_TOKENS: u64 = 10;

/// How many turns of history get replayed to the answer provider.
pub const HISTORY_WINDOW: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One conversation turn. Media turns keep the attachment reference next to
/// the caption so the provider can replay vision context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TurnContent {
    Text(String),
    Media { text: String, attachment_url: String },
}

impl TurnContent {
    pub fn text(&self) -> &str {
        match self {
            TurnContent::Text(text) => text,
            TurnContent::Media { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user(content: TurnContent) -> Self {
        ConversationTurn {
            role: TurnRole::User,
            content,
        }
    }

    pub fn assistant(text: String) -> Self {
        ConversationTurn {
            role: TurnRole::Assistant,
            content: TurnContent::Text(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedConversation {
    pub title: String,
    pub archived_at: i64,
    pub turns: Vec<ConversationTurn>,
}

/// The per-user document. Balance mutation goes through `UserLedger` only;
/// every field change is a compare-and-swap on the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Channel-qualified id (`tg:<id>` / `wa:<id>`).
    pub id: String,
    pub display_name: String,
    pub token_balance: u64,
    pub streak_count: u64,
    pub last_active_at: Option<i64>,
    pub last_streak_reminder_at: Option<i64>,
    pub last_streak_reward_at: Option<i64>,
    pub email: Option<String>,
    pub conversation: Vec<ConversationTurn>,
    pub archived: Vec<ArchivedConversation>,
    pub created_at: i64,
}

impl User {
    pub fn new(id: String, display_name: String, starting_tokens: u64, now: i64) -> Self {
        User {
            id,
            display_name,
            token_balance: starting_tokens,
            streak_count: 0,
            last_active_at: None,
            last_streak_reminder_at: None,
            last_streak_reward_at: None,
            email: None,
            conversation: Vec::new(),
            archived: Vec::new(),
            created_at: now,
        }
    }

    /// Trailing window of the live conversation for provider replay.
    pub fn history_window(&self) -> &[ConversationTurn] {
        let len = self.conversation.len();
        let start = len.saturating_sub(HISTORY_WINDOW);
        &self.conversation[start..]
    }
}
