use sema_core::error::BotError;
use sema_core::helpers::utils::now_ts;
use sled::{Db, Tree};

use crate::ledger::handler::UserLedger;

use super::dto::{RequestRecord, RequestStatus};

const TREE_NAME: &str = "requests";

/// Request Tracker and Idempotency Guard in one: creating the record *is*
/// the idempotency claim (a single atomic insert-if-absent), and the status
/// field is the lock that decides which flow owns the terminal transition.
#[derive(Clone)]
pub struct RequestTracker {
    tree: Tree,
    ledger: UserLedger,
}

impl RequestTracker {
    pub fn new(db: &Db, ledger: UserLedger) -> sled::Result<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree, ledger })
    }

    /// Atomic claim. A second delivery of the same (user, message) pair finds
    /// the existing record — whatever its status — and is a duplicate.
    pub fn claim(
        &self,
        user_id: &str,
        message_id: &str,
        token_cost: u64,
        prompt: &str,
        attachment_url: Option<String>,
    ) -> Result<RequestRecord, BotError> {
        let record = RequestRecord {
            id: RequestRecord::record_id(user_id, message_id),
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            token_cost,
            status: RequestStatus::Processing,
            prompt: prompt.to_string(),
            attachment_url,
            error: None,
            created_at: now_ts(),
        };
        let encoded = serde_json::to_vec(&record)?;
        match self
            .tree
            .compare_and_swap(record.id.as_bytes(), None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => Ok(record),
            Err(_) => Err(BotError::DuplicateMessage),
        }
    }

    pub fn get(&self, request_id: &str) -> Result<RequestRecord, BotError> {
        let bytes = self
            .tree
            .get(request_id.as_bytes())?
            .ok_or(BotError::NotFound)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The single authoritative transition function: `processing -> to`,
    /// conditional on the record still being `processing`. Exactly one caller
    /// can ever win a given record's terminal transition.
    pub fn transition(
        &self,
        request_id: &str,
        to: RequestStatus,
        error: Option<String>,
    ) -> Result<RequestRecord, BotError> {
        loop {
            let current = self
                .tree
                .get(request_id.as_bytes())?
                .ok_or(BotError::NotFound)?;
            let mut record: RequestRecord = serde_json::from_slice(&current)?;
            if record.status.is_terminal() {
                return Err(BotError::AlreadyTerminal(record.status.as_str().to_string()));
            }
            record.status = to;
            record.error = error.clone();
            let encoded = serde_json::to_vec(&record)?;
            match self
                .tree
                .compare_and_swap(request_id.as_bytes(), Some(current), Some(encoded))?
            {
                Ok(()) => return Ok(record),
                Err(_) => continue,
            }
        }
    }

    /// User-initiated cancellation. Winning the transition carries the refund
    /// with it; a cancel that loses the race refunds nothing.
    pub fn cancel(
        &self,
        request_id: &str,
        requesting_user: &str,
    ) -> Result<RequestRecord, BotError> {
        let record = self.get(request_id)?;
        if record.user_id != requesting_user {
            return Err(BotError::Forbidden);
        }
        let cancelled = self.transition(request_id, RequestStatus::Cancelled, None)?;
        self.ledger.credit(&cancelled.user_id, cancelled.token_cost)?;
        log::info!(
            "request {} cancelled, refunded {} tokens",
            request_id,
            cancelled.token_cost
        );
        Ok(cancelled)
    }

    /// Newest still-processing request for a user. The WhatsApp "cancel"
    /// keyword has no callback payload to name a request id.
    pub fn latest_processing_for(&self, user_id: &str) -> Result<Option<RequestRecord>, BotError> {
        let prefix = format!("{}:", user_id);
        let mut latest: Option<RequestRecord> = None;
        for value in self.tree.scan_prefix(prefix.as_bytes()).values() {
            let record: RequestRecord = serde_json::from_slice(&value?)?;
            if record.status != RequestStatus::Processing {
                continue;
            }
            if latest
                .as_ref()
                .map(|l| record.created_at > l.created_at)
                .unwrap_or(true)
            {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    /// Maintenance sweep: drop settled and stale records past retention.
    pub fn purge_older_than(&self, cutoff_ts: i64) -> Result<usize, BotError> {
        let mut purged = 0;
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let record: RequestRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(e) => {
                    log::error!("skipping corrupt request record: {}", e);
                    continue;
                }
            };
            if record.created_at < cutoff_ts {
                self.tree.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
