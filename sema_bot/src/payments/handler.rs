use std::collections::HashMap;
use std::sync::Arc;

use sema_core::error::BotError;
use sema_core::helpers::dto::{GatewayKind, PaymentInit, VerifyStatus};
use sema_core::helpers::utils::{new_payment_reference, now_ts, tokens_for_amount};
use sled::{Db, Tree};

use crate::ledger::dto::User;
use crate::ledger::handler::UserLedger;

use super::dto::{
    TransactionRecord, TransactionStatus, VerificationRecord, VerifyOutcome, WebhookCredit,
    TRANSACTION_EXPIRY_SECS,
};
use super::gateway::PaymentGateway;

const TRANSACTIONS_TREE: &str = "transactions";
const VERIFICATIONS_TREE: &str = "verifications";

/// Initializes payment intents and settles them exactly once, no matter how
/// many times verification fires (webhook, manual /verify, retries).
///
/// Settlement order is mark-then-credit: the verification record is
/// CAS-inserted *before* the ledger credit, then the transaction flips
/// pending -> success. A crash between mark and credit surfaces in the error
/// log for manual reconciliation; it can never double-credit on retry.
#[derive(Clone)]
pub struct PaymentReconciler {
    transactions: Tree,
    verifications: Tree,
    ledger: UserLedger,
    gateways: HashMap<GatewayKind, Arc<dyn PaymentGateway>>,
    callback_url: String,
}

impl PaymentReconciler {
    pub fn new(
        db: &Db,
        ledger: UserLedger,
        gateways: Vec<Arc<dyn PaymentGateway>>,
        callback_url: String,
    ) -> sled::Result<Self> {
        let transactions = db.open_tree(TRANSACTIONS_TREE)?;
        let verifications = db.open_tree(VERIFICATIONS_TREE)?;
        let gateways = gateways.into_iter().map(|g| (g.kind(), g)).collect();
        Ok(Self {
            transactions,
            verifications,
            ledger,
            gateways,
            callback_url,
        })
    }

    fn gateway(&self, kind: GatewayKind) -> Result<&Arc<dyn PaymentGateway>, BotError> {
        self.gateways
            .get(&kind)
            .ok_or_else(|| BotError::GatewayFailure(format!("{} is not configured", kind)))
    }

    pub fn get(&self, reference: &str) -> Result<TransactionRecord, BotError> {
        let bytes = self
            .transactions
            .get(reference.as_bytes())?
            .ok_or(BotError::NotFound)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Conditional `pending -> to` flip; the status field is the lock.
    fn transition(
        &self,
        reference: &str,
        to: TransactionStatus,
        raw_response: Option<serde_json::Value>,
    ) -> Result<TransactionRecord, BotError> {
        loop {
            let current = self
                .transactions
                .get(reference.as_bytes())?
                .ok_or(BotError::NotFound)?;
            let mut record: TransactionRecord = serde_json::from_slice(&current)?;
            if record.status != TransactionStatus::Pending {
                return Err(BotError::AlreadyTerminal(record.status.as_str().to_string()));
            }
            record.status = to;
            record.completed_at = Some(now_ts());
            if raw_response.is_some() {
                record.raw_response = raw_response.clone();
            }
            let encoded = serde_json::to_vec(&record)?;
            match self.transactions.compare_and_swap(
                reference.as_bytes(),
                Some(current),
                Some(encoded),
            )? {
                Ok(()) => return Ok(record),
                Err(_) => continue,
            }
        }
    }

    /// Create the pending transaction locally, then ask the gateway for a
    /// checkout link. The reference exists before the network call, so a
    /// half-failed initialization still leaves an auditable failed record.
    pub async fn initiate(
        &self,
        user: &User,
        amount_minor: u64,
        kind: GatewayKind,
    ) -> Result<PaymentInit, BotError> {
        let tokens = tokens_for_amount(amount_minor);
        if tokens == 0 {
            return Err(BotError::GatewayFailure(
                "amount too small to buy any tokens".to_string(),
            ));
        }
        let gateway = self.gateway(kind)?;

        let reference = new_payment_reference(&user.id);
        let now = now_ts();
        let record = TransactionRecord {
            reference: reference.clone(),
            user_id: user.id.clone(),
            amount_minor,
            tokens,
            gateway: kind,
            status: TransactionStatus::Pending,
            created_at: now,
            expires_at: now + TRANSACTION_EXPIRY_SECS,
            completed_at: None,
            raw_response: None,
        };
        self.transactions
            .insert(reference.as_bytes(), serde_json::to_vec(&record)?)?;

        // Receipts need an address even before the user shares one.
        let email = user
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@receipts.sema.app", user.id.replace(':', "-")));

        match gateway
            .initialize(&reference, &email, amount_minor, &self.callback_url)
            .await
        {
            Ok(init) => {
                log::info!(
                    "payment {} initiated for {} ({} tokens, {})",
                    reference,
                    user.id,
                    tokens,
                    kind
                );
                Ok(init)
            }
            Err(e) => {
                let _ = self.transition(&reference, TransactionStatus::Failed, None);
                Err(e)
            }
        }
    }

    /// Safe to call any number of times per reference from any path.
    pub async fn verify(&self, reference: &str) -> Result<VerifyOutcome, BotError> {
        let record = self.get(reference)?;

        let verification_key = VerificationRecord::key(&record.user_id, reference);
        if self.verifications.get(verification_key.as_bytes())?.is_some() {
            return Ok(VerifyOutcome::AlreadyCredited);
        }

        match record.status {
            // Mark-then-credit means a success status implies the credit
            // already happened; the verification lookup above is the guard
            // for the window where the two raced.
            TransactionStatus::Success => return Ok(VerifyOutcome::AlreadyCredited),
            TransactionStatus::Failed => return Ok(VerifyOutcome::Failed),
            TransactionStatus::Pending => {}
        }

        let status = self.gateway(record.gateway)?.verify(reference).await?;
        let amount_minor = match status {
            VerifyStatus::Pending => return Ok(VerifyOutcome::Pending),
            VerifyStatus::Failed => {
                let _ = self.transition(reference, TransactionStatus::Failed, None);
                return Ok(VerifyOutcome::Failed);
            }
            VerifyStatus::Success { amount_minor } => amount_minor,
        };
        if amount_minor < record.amount_minor {
            log::error!(
                "payment {} verified for {} minor units, expected {}; failing it",
                reference,
                amount_minor,
                record.amount_minor
            );
            let _ = self.transition(reference, TransactionStatus::Failed, None);
            return Ok(VerifyOutcome::Failed);
        }

        // Mark: atomic insert-if-absent decides the single winner between
        // the webhook and any manual verify running at the same time.
        let verification = VerificationRecord {
            user_id: record.user_id.clone(),
            reference: reference.to_string(),
            tokens: record.tokens,
            verified_at: now_ts(),
        };
        let encoded = serde_json::to_vec(&verification)?;
        match self.verifications.compare_and_swap(
            verification_key.as_bytes(),
            None as Option<&[u8]>,
            Some(encoded),
        )? {
            Ok(()) => {}
            Err(_) => return Ok(VerifyOutcome::AlreadyCredited),
        }

        // Credit, then flip the transaction. If the credit itself fails the
        // mark already exists; shout loudly, never retry into a double pay.
        if let Err(e) = self.ledger.credit(&record.user_id, record.tokens) {
            log::error!(
                "MARKED BUT NOT CREDITED: reference {} user {} tokens {}: {}",
                reference,
                record.user_id,
                record.tokens,
                e
            );
            return Err(e);
        }
        if let Err(e) = self.transition(reference, TransactionStatus::Success, None) {
            log::error!("payment {} credited but status flip failed: {}", reference, e);
        }

        log::info!(
            "payment {} settled: {} tokens credited to {}",
            reference,
            record.tokens,
            record.user_id
        );
        Ok(VerifyOutcome::Credited {
            tokens: record.tokens,
            amount_minor,
        })
    }

    /// Gateway-initiated settlement. Never errors out to the caller: the
    /// webhook must always be acknowledged to stop retry storms, and any
    /// internal failure is logged with the payload for manual follow-up.
    pub async fn handle_webhook(
        &self,
        kind: GatewayKind,
        payload: serde_json::Value,
    ) -> Option<WebhookCredit> {
        let reference = Self::reference_from_payload(&payload);
        let reference = match reference {
            Some(reference) => reference,
            None => {
                log::error!("{} webhook without a reference: {}", kind, payload);
                return None;
            }
        };

        match self.verify(&reference).await {
            Ok(VerifyOutcome::Credited { tokens, .. }) => {
                let user_id = match self.get(&reference) {
                    Ok(record) => record.user_id,
                    Err(_) => return None,
                };
                Some(WebhookCredit {
                    user_id,
                    reference,
                    tokens,
                })
            }
            Ok(outcome) => {
                log::info!("{} webhook for {}: {:?}", kind, reference, outcome);
                None
            }
            Err(e) => {
                log::error!(
                    "{} webhook processing failed for {} (payload {}): {}",
                    kind,
                    reference,
                    payload,
                    e
                );
                None
            }
        }
    }

    fn reference_from_payload(payload: &serde_json::Value) -> Option<String> {
        let candidates = [
            &payload["data"]["reference"],
            &payload["data"]["tx_ref"],
            &payload["reference"],
            &payload["tx_ref"],
        ];
        candidates
            .iter()
            .find_map(|v| v.as_str())
            .map(str::to_string)
    }

    /// Maintenance sweep: pending transactions past expiry become failed.
    pub fn expire_pending(&self, now: i64) -> Result<usize, BotError> {
        let mut expired = 0;
        for value in self.transactions.iter().values() {
            let record: TransactionRecord = match serde_json::from_slice(&value?) {
                Ok(record) => record,
                Err(e) => {
                    log::error!("skipping corrupt transaction record: {}", e);
                    continue;
                }
            };
            if record.status != TransactionStatus::Pending || now <= record.expires_at {
                continue;
            }
            match self.transition(&record.reference, TransactionStatus::Failed, None) {
                Ok(_) => {
                    log::info!("expired pending payment {}", record.reference);
                    expired += 1;
                }
                // A verify settled it between the scan and the flip.
                Err(BotError::AlreadyTerminal(_)) => {}
                Err(e) => log::error!("expiry of {} failed: {}", record.reference, e),
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::dto::STARTING_TOKENS;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeGateway {
        kind: GatewayKind,
        verify_result: Mutex<VerifyStatus>,
        init_fails: bool,
        verify_calls: AtomicUsize,
    }

    impl FakeGateway {
        fn succeeding(amount_minor: u64) -> Arc<Self> {
            Arc::new(Self {
                kind: GatewayKind::Paystack,
                verify_result: Mutex::new(VerifyStatus::Success { amount_minor }),
                init_fails: false,
                verify_calls: AtomicUsize::new(0),
            })
        }

        fn set_verify(&self, status: VerifyStatus) {
            *self.verify_result.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        fn kind(&self) -> GatewayKind {
            self.kind
        }

        async fn initialize(
            &self,
            reference: &str,
            _email: &str,
            _amount_minor: u64,
            _callback_url: &str,
        ) -> Result<PaymentInit, BotError> {
            if self.init_fails {
                return Err(BotError::GatewayFailure("gateway down".to_string()));
            }
            Ok(PaymentInit {
                reference: reference.to_string(),
                redirect_url: format!("https://pay.example/{}", reference),
            })
        }

        async fn verify(&self, _reference: &str) -> Result<VerifyStatus, BotError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verify_result.lock().unwrap().clone())
        }
    }

    struct Fixture {
        reconciler: PaymentReconciler,
        ledger: UserLedger,
        gateway: Arc<FakeGateway>,
        user: User,
    }

    fn fixture(gateway: Arc<FakeGateway>) -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = UserLedger::new(&db).unwrap();
        let (user, _) = ledger.create_if_absent("tg:1", "Ada").unwrap();
        let reconciler = PaymentReconciler::new(
            &db,
            ledger.clone(),
            vec![gateway.clone()],
            "https://sema.app/pay/callback".to_string(),
        )
        .unwrap();
        Fixture {
            reconciler,
            ledger,
            gateway,
            user,
        }
    }

    #[tokio::test]
    async fn test_initiate_persists_pending_before_gateway() {
        let f = fixture(FakeGateway::succeeding(500));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        let record = f.reconciler.get(&init.reference).unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.tokens, 10);
        assert!(init.redirect_url.contains(&init.reference));
    }

    #[tokio::test]
    async fn test_initiate_gateway_failure_leaves_failed_record() {
        let gateway = Arc::new(FakeGateway {
            kind: GatewayKind::Paystack,
            verify_result: Mutex::new(VerifyStatus::Failed),
            init_fails: true,
            verify_calls: AtomicUsize::new(0),
        });
        let f = fixture(gateway);

        let err = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::GatewayFailure(_)));
        // No tokens moved.
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );
    }

    #[tokio::test]
    async fn test_verify_credits_exactly_once() {
        let f = fixture(FakeGateway::succeeding(500));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        // Webhook settles first.
        let first = f.reconciler.verify(&init.reference).await.unwrap();
        assert_eq!(
            first,
            VerifyOutcome::Credited {
                tokens: 10,
                amount_minor: 500
            }
        );
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS + 10
        );

        // Then the user runs /verify for the same reference.
        let second = f.reconciler.verify(&init.reference).await.unwrap();
        assert_eq!(second, VerifyOutcome::AlreadyCredited);
        let third = f.reconciler.verify(&init.reference).await.unwrap();
        assert_eq!(third, VerifyOutcome::AlreadyCredited);

        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS + 10
        );
        // Gateway only consulted by the settling call.
        assert_eq!(f.gateway.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verify_pending_then_success() {
        let f = fixture(FakeGateway::succeeding(500));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        f.gateway.set_verify(VerifyStatus::Pending);
        assert_eq!(
            f.reconciler.verify(&init.reference).await.unwrap(),
            VerifyOutcome::Pending
        );
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );

        f.gateway.set_verify(VerifyStatus::Success { amount_minor: 500 });
        assert!(matches!(
            f.reconciler.verify(&init.reference).await.unwrap(),
            VerifyOutcome::Credited { tokens: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_underpaid_verification_fails_transaction() {
        let f = fixture(FakeGateway::succeeding(100));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        assert_eq!(
            f.reconciler.verify(&init.reference).await.unwrap(),
            VerifyOutcome::Failed
        );
        assert_eq!(
            f.reconciler.get(&init.reference).unwrap().status,
            TransactionStatus::Failed
        );
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );
    }

    #[tokio::test]
    async fn test_webhook_path_extracts_reference_and_credits() {
        let f = fixture(FakeGateway::succeeding(500));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        let payload = serde_json::json!({
            "event": "charge.success",
            "data": { "reference": init.reference, "amount": 500 }
        });
        let credit = f
            .reconciler
            .handle_webhook(GatewayKind::Paystack, payload.clone())
            .await
            .unwrap();
        assert_eq!(credit.user_id, "tg:1");
        assert_eq!(credit.tokens, 10);

        // Redelivered webhook acks without crediting again.
        assert!(f
            .reconciler
            .handle_webhook(GatewayKind::Paystack, payload)
            .await
            .is_none());
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS + 10
        );
    }

    #[tokio::test]
    async fn test_expire_pending_sweep() {
        let f = fixture(FakeGateway::succeeding(500));
        let init = f
            .reconciler
            .initiate(&f.user, 500, GatewayKind::Paystack)
            .await
            .unwrap();

        assert_eq!(f.reconciler.expire_pending(now_ts()).unwrap(), 0);
        assert_eq!(
            f.reconciler
                .expire_pending(now_ts() + TRANSACTION_EXPIRY_SECS + 1)
                .unwrap(),
            1
        );
        assert_eq!(
            f.reconciler.get(&init.reference).unwrap().status,
            TransactionStatus::Failed
        );

        // Verify on the expired transaction reports failed, no credit.
        assert_eq!(
            f.reconciler.verify(&init.reference).await.unwrap(),
            VerifyOutcome::Failed
        );
    }
}
