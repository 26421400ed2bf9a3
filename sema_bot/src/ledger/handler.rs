use sema_core::error::BotError;
use sema_core::helpers::utils::now_ts;
use sled::{Db, Tree};

use super::dto::{ArchivedConversation, ConversationTurn, User, STARTING_TOKENS};

const TREE_NAME: &str = "users";

/// Sole owner of user documents. Every mutation is a compare-and-swap on the
/// full document, so two concurrent adjustments for the same user both land
/// (one retries) and a debit can never be lost to a stale read.
#[derive(Clone)]
pub struct UserLedger {
    tree: Tree,
}

impl UserLedger {
    pub fn new(db: &Db) -> sled::Result<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }

    pub fn get(&self, id: &str) -> Result<Option<User>, BotError> {
        let bytes = self.tree.get(id.as_bytes())?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_required(&self, id: &str) -> Result<User, BotError> {
        self.get(id)?.ok_or(BotError::NotFound)
    }

    /// Insert-if-absent account creation. Two concurrent first messages race
    /// on the swap; the loser reads back the winner's account, so exactly one
    /// starting grant is ever issued per id.
    pub fn create_if_absent(&self, id: &str, display_name: &str) -> Result<(User, bool), BotError> {
        let user = User::new(
            id.to_string(),
            display_name.to_string(),
            STARTING_TOKENS,
            now_ts(),
        );
        let encoded = serde_json::to_vec(&user)?;
        match self
            .tree
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => Ok((user, true)),
            Err(_) => Ok((self.get_required(id)?, false)),
        }
    }

    /// CAS update loop shared by every mutation below (and the streak
    /// tracker). The closure sees the freshest document on each retry.
    pub(crate) fn update<F>(&self, id: &str, mut mutate: F) -> Result<User, BotError>
    where
        F: FnMut(&mut User) -> Result<(), BotError>,
    {
        loop {
            let current = self.tree.get(id.as_bytes())?.ok_or(BotError::NotFound)?;
            let mut user: User = serde_json::from_slice(&current)?;
            mutate(&mut user)?;
            let encoded = serde_json::to_vec(&user)?;
            match self
                .tree
                .compare_and_swap(id.as_bytes(), Some(current), Some(encoded))?
            {
                Ok(()) => return Ok(user),
                Err(_) => continue,
            }
        }
    }

    pub fn credit(&self, id: &str, amount: u64) -> Result<u64, BotError> {
        let user = self.update(id, |user| {
            user.token_balance = user.token_balance.saturating_add(amount);
            Ok(())
        })?;
        Ok(user.token_balance)
    }

    /// Fail-closed debit for billing: the whole cost or nothing.
    pub fn debit(&self, id: &str, amount: u64) -> Result<u64, BotError> {
        let user = self.update(id, |user| {
            if user.token_balance < amount {
                return Err(BotError::InsufficientBalance {
                    have: user.token_balance,
                    need: amount,
                });
            }
            user.token_balance -= amount;
            Ok(())
        })?;
        Ok(user.token_balance)
    }

    pub fn append_turns(&self, id: &str, turns: &[ConversationTurn]) -> Result<(), BotError> {
        self.update(id, |user| {
            user.conversation.extend(turns.iter().cloned());
            Ok(())
        })?;
        Ok(())
    }

    /// Move the live conversation into the archive under the given title.
    pub fn archive_conversation(&self, id: &str, title: &str) -> Result<usize, BotError> {
        let mut archived_len = 0;
        self.update(id, |user| {
            let turns = std::mem::take(&mut user.conversation);
            archived_len = turns.len();
            if !turns.is_empty() {
                user.archived.push(ArchivedConversation {
                    title: title.to_string(),
                    archived_at: now_ts(),
                    turns,
                });
            }
            Ok(())
        })?;
        Ok(archived_len)
    }

    pub fn set_email(&self, id: &str, email: &str) -> Result<(), BotError> {
        self.update(id, |user| {
            user.email = Some(email.to_string());
            Ok(())
        })?;
        Ok(())
    }

    /// Full scan for the maintenance sweeps. Corrupt entries are skipped and
    /// logged rather than aborting the sweep.
    pub fn iter(&self) -> impl Iterator<Item = User> {
        self.tree.iter().values().filter_map(|value| match value {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(user) => Some(user),
                Err(e) => {
                    log::error!("skipping corrupt user document: {}", e);
                    None
                }
            },
            Err(e) => {
                log::error!("user scan read error: {}", e);
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::dto::{TurnContent, HISTORY_WINDOW};

    fn test_ledger() -> UserLedger {
        let db = sled::Config::new().temporary(true).open().unwrap();
        UserLedger::new(&db).unwrap()
    }

    #[test]
    fn test_create_is_idempotent() {
        let ledger = test_ledger();
        let (user, created) = ledger.create_if_absent("tg:1", "Ada").unwrap();
        assert!(created);
        assert_eq!(user.token_balance, STARTING_TOKENS);

        let (again, created) = ledger.create_if_absent("tg:1", "Ada Again").unwrap();
        assert!(!created);
        // No second grant, original document kept.
        assert_eq!(again.token_balance, STARTING_TOKENS);
        assert_eq!(again.display_name, "Ada");
    }

    #[test]
    fn test_no_lost_update_under_concurrent_adjustments() {
        let ledger = test_ledger();
        ledger.create_if_absent("tg:1", "Ada").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    ledger.credit("tg:1", 1).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let user = ledger.get_required("tg:1").unwrap();
        assert_eq!(user.token_balance, STARTING_TOKENS + 200);
    }

    #[test]
    fn test_debit_fails_closed() {
        let ledger = test_ledger();
        ledger.create_if_absent("tg:1", "Ada").unwrap();

        let err = ledger.debit("tg:1", STARTING_TOKENS + 1).unwrap_err();
        assert!(matches!(
            err,
            BotError::InsufficientBalance { have, need }
                if have == STARTING_TOKENS && need == STARTING_TOKENS + 1
        ));
        // Nothing was taken.
        assert_eq!(
            ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );
    }

    #[test]
    fn test_archive_moves_live_conversation() {
        let ledger = test_ledger();
        ledger.create_if_absent("tg:1", "Ada").unwrap();
        ledger
            .append_turns(
                "tg:1",
                &[
                    ConversationTurn::user(TurnContent::Text("hi".into())),
                    ConversationTurn::assistant("hello".into()),
                ],
            )
            .unwrap();

        let archived = ledger.archive_conversation("tg:1", "old chat").unwrap();
        assert_eq!(archived, 2);

        let user = ledger.get_required("tg:1").unwrap();
        assert!(user.conversation.is_empty());
        assert_eq!(user.archived.len(), 1);
        assert_eq!(user.archived[0].title, "old chat");

        // Archiving an empty conversation does not stack empty snapshots.
        ledger.archive_conversation("tg:1", "empty").unwrap();
        assert_eq!(ledger.get_required("tg:1").unwrap().archived.len(), 1);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let ledger = test_ledger();
        ledger.create_if_absent("tg:1", "Ada").unwrap();
        for i in 0..60 {
            ledger
                .append_turns(
                    "tg:1",
                    &[ConversationTurn::user(TurnContent::Text(format!("m{}", i)))],
                )
                .unwrap();
        }
        let user = ledger.get_required("tg:1").unwrap();
        assert_eq!(user.history_window().len(), HISTORY_WINDOW);
        assert_eq!(user.history_window()[0].content.text(), "m20");
    }
}
