use std::sync::Arc;
use std::time::Duration;

use sema_core::error::BotError;
use sema_core::helpers::dto::InboundMessage;
use sema_core::helpers::utils::now_ts;
use tokio::time::timeout;

use crate::ai::AnswerProvider;
use crate::ledger::dto::{ConversationTurn, TurnContent};
use crate::ledger::handler::UserLedger;
use crate::requests::dto::{RequestRecord, RequestStatus};
use crate::requests::handler::RequestTracker;
use crate::streaks::handler::StreakTracker;

/// Upper bound on one provider round trip. A timeout is just a provider
/// failure: refund and mark the record failed.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(90);

/// What one orchestrator cycle resolved to. Channel handlers turn this into
/// the actual outbound message; `Dropped` means say nothing at all.
#[derive(Debug)]
pub enum AnswerOutcome {
    /// First contact: account created with the starting grant, not billed.
    Welcome,
    Reply {
        request_id: String,
        text: String,
    },
    /// Post-debit failure, tokens already returned.
    Refunded {
        reason: String,
    },
    InsufficientTokens {
        have: u64,
        need: u64,
    },
    /// Duplicate delivery, or a cancellation won the race.
    Dropped,
}

impl AnswerOutcome {
    /// Channel-neutral reply text. `None` means stay silent.
    pub fn user_text(&self) -> Option<String> {
        match self {
            AnswerOutcome::Welcome => Some(
                "👋 Welcome to Sema! Ask me anything and I'll answer.\n\n\
                 Every text question costs 1 token, questions with a photo cost 2. \
                 You start with a free grant; check /balance, top up with /buy."
                    .to_string(),
            ),
            AnswerOutcome::Reply { text, .. } => Some(text.clone()),
            AnswerOutcome::Refunded { reason } => Some(format!(
                "⚠️ I couldn't get an answer ({}). Your tokens were refunded; please resend.",
                reason
            )),
            AnswerOutcome::InsufficientTokens { have, need } => Some(format!(
                "You need {} token(s) for that but only have {}. Top up with /buy.",
                need, have
            )),
            AnswerOutcome::Dropped => None,
        }
    }
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled { refunded: u64 },
    AlreadyFinished { status: String },
    NotFound,
    NotYours,
}

impl CancelOutcome {
    pub fn user_text(&self) -> String {
        match self {
            CancelOutcome::Cancelled { refunded } => {
                format!("❌ Cancelled. {} token(s) refunded.", refunded)
            }
            CancelOutcome::AlreadyFinished { status } => {
                format!("Nothing to cancel, that request is already {}.", status)
            }
            CancelOutcome::NotFound => "No request in flight to cancel.".to_string(),
            CancelOutcome::NotYours => "That request belongs to someone else.".to_string(),
        }
    }
}

/// The per-message state machine: claim, debit, ask, re-check, commit or
/// refund. One instance serves every channel; handlers feed it normalized
/// `InboundMessage`s and deliver whatever comes back.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: UserLedger,
    tracker: RequestTracker,
    streaks: StreakTracker,
    provider: Arc<dyn AnswerProvider>,
}

impl Orchestrator {
    pub fn new(
        ledger: UserLedger,
        tracker: RequestTracker,
        streaks: StreakTracker,
        provider: Arc<dyn AnswerProvider>,
    ) -> Self {
        Self {
            ledger,
            tracker,
            streaks,
            provider,
        }
    }

    pub async fn answer(&self, inbound: &InboundMessage) -> Result<AnswerOutcome, BotError> {
        // 1. Resolve the user; first contact gets the grant and a welcome,
        //    nothing billed and no record claimed.
        let (user, created) = self
            .ledger
            .create_if_absent(&inbound.user_id, &inbound.display_name)?;
        if created {
            log::info!("new user {} via {}", inbound.user_id, inbound.channel);
            return Ok(AnswerOutcome::Welcome);
        }

        // 2. Cost and a fail-closed pre-check, before any record exists. A
        //    redelivery can arrive after the balance already dropped below
        //    cost; it is still a duplicate and must stay silent.
        let cost = inbound.token_cost();
        if user.token_balance < cost {
            let record_id = RequestRecord::record_id(&inbound.user_id, &inbound.message_id);
            if self.tracker.get(&record_id).is_ok() {
                log::debug!(
                    "dropping redelivered message {} for {} (balance below cost)",
                    inbound.message_id,
                    inbound.user_id
                );
                return Ok(AnswerOutcome::Dropped);
            }
            return Ok(AnswerOutcome::InsufficientTokens {
                have: user.token_balance,
                need: cost,
            });
        }

        // 3. Idempotency claim. The claim is the request record; a duplicate
        //    delivery in any state is dropped silently.
        let record = match self.tracker.claim(
            &inbound.user_id,
            &inbound.message_id,
            cost,
            inbound.content.prompt_text(),
            inbound.content.attachment_url().map(str::to_string),
        ) {
            Ok(record) => record,
            Err(BotError::DuplicateMessage) => {
                log::debug!(
                    "dropping redelivered message {} for {}",
                    inbound.message_id,
                    inbound.user_id
                );
                return Ok(AnswerOutcome::Dropped);
            }
            Err(e) => return Err(e),
        };

        // 4. Debit. The record above is what makes the refund possible. If a
        //    concurrent debit drained the balance between the pre-check and
        //    here, fail the record closed; nothing was taken.
        if let Err(e) = self.ledger.debit(&inbound.user_id, cost) {
            return match e {
                BotError::InsufficientBalance { have, need } => {
                    let _ = self.tracker.transition(
                        &record.id,
                        RequestStatus::Failed,
                        Some("insufficient balance at debit".to_string()),
                    );
                    Ok(AnswerOutcome::InsufficientTokens { have, need })
                }
                other => Err(other),
            };
        }

        // 5. Streak update rides alongside; its failure never aborts the
        //    answer flow.
        {
            let streaks = self.streaks.clone();
            let user_id = inbound.user_id.clone();
            tokio::spawn(async move {
                if let Err(e) = streaks.record_activity(&user_id, now_ts()) {
                    log::warn!("streak update for {} failed: {}", user_id, e);
                }
            });
        }

        // 6–10. Everything after the debit is caught and settled: either the
        // completed transition wins, or the failed transition wins and
        // refunds, or a cancellation already won and already refunded.
        match self.ask_and_commit(inbound, &record).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => self.settle_failure(&record, failure),
        }
    }

    async fn ask_and_commit(
        &self,
        inbound: &InboundMessage,
        record: &RequestRecord,
    ) -> Result<AnswerOutcome, BotError> {
        // Checkpoint before the long call: a cancel that already landed has
        // already refunded, so just stop.
        if self.tracker.get(&record.id)?.status.is_terminal() {
            return Ok(AnswerOutcome::Dropped);
        }

        // Fresh history snapshot for the provider.
        let user = self.ledger.get_required(&inbound.user_id)?;
        let history = user.history_window().to_vec();
        let answer = match timeout(
            PROVIDER_TIMEOUT,
            self.provider.ask(
                &history,
                inbound.content.prompt_text(),
                inbound.content.attachment_url(),
            ),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(BotError::ProviderFailure(
                    "timed out waiting for the model".to_string(),
                ))
            }
        };

        // Checkpoint after the call, fused with the commit: winning the
        // `processing -> completed` swap is what makes the answer real. A
        // cancellation that landed first keeps its refund and the answer is
        // discarded, never appended, never delivered.
        match self
            .tracker
            .transition(&record.id, RequestStatus::Completed, None)
        {
            Ok(_) => {}
            Err(BotError::AlreadyTerminal(status)) => {
                log::info!(
                    "discarding answer for request {} ({} won the race)",
                    record.id,
                    status
                );
                return Ok(AnswerOutcome::Dropped);
            }
            Err(e) => return Err(e),
        }

        // History append is eventually consistent with the balance; a failure
        // here is logged, never refunded (the answer was delivered and paid).
        let user_turn = ConversationTurn::user(match &inbound.content {
            sema_core::helpers::dto::MessageContent::Text(text) => TurnContent::Text(text.clone()),
            sema_core::helpers::dto::MessageContent::Media { url, caption, .. } => {
                TurnContent::Media {
                    text: caption.clone(),
                    attachment_url: url.clone(),
                }
            }
        });
        let turns = [user_turn, ConversationTurn::assistant(answer.clone())];
        if let Err(e) = self.ledger.append_turns(&inbound.user_id, &turns) {
            log::error!(
                "history append for request {} failed after completion: {}",
                record.id,
                e
            );
        }

        Ok(AnswerOutcome::Reply {
            request_id: record.id.clone(),
            text: answer,
        })
    }

    /// Post-debit failure path. The refund belongs to whichever flow wins
    /// the terminal transition; losing it means a cancel already refunded.
    fn settle_failure(
        &self,
        record: &RequestRecord,
        failure: BotError,
    ) -> Result<AnswerOutcome, BotError> {
        let reason = failure.to_string();
        match self
            .tracker
            .transition(&record.id, RequestStatus::Failed, Some(reason.clone()))
        {
            Ok(failed) => {
                self.ledger.credit(&failed.user_id, failed.token_cost)?;
                log::warn!(
                    "request {} failed ({}), refunded {} tokens",
                    record.id,
                    reason,
                    failed.token_cost
                );
                Ok(AnswerOutcome::Refunded { reason })
            }
            Err(BotError::AlreadyTerminal(_)) => Ok(AnswerOutcome::Dropped),
            Err(e) => Err(e),
        }
    }

    /// Cancellation entry point, shared by the Telegram callback button and
    /// the WhatsApp "cancel" keyword.
    pub fn cancel(&self, request_id: &str, requesting_user: &str) -> CancelOutcome {
        match self.tracker.cancel(request_id, requesting_user) {
            Ok(record) => CancelOutcome::Cancelled {
                refunded: record.token_cost,
            },
            Err(BotError::AlreadyTerminal(status)) => CancelOutcome::AlreadyFinished { status },
            Err(BotError::Forbidden) => CancelOutcome::NotYours,
            Err(BotError::NotFound) => CancelOutcome::NotFound,
            Err(e) => {
                log::error!("cancel of {} failed: {}", request_id, e);
                CancelOutcome::NotFound
            }
        }
    }

    /// Cancel the newest in-flight request for a user (keyword channels).
    pub fn cancel_latest(&self, user_id: &str) -> CancelOutcome {
        match self.tracker.latest_processing_for(user_id) {
            Ok(Some(record)) => self.cancel(&record.id, user_id),
            Ok(None) => CancelOutcome::NotFound,
            Err(e) => {
                log::error!("latest-request lookup for {} failed: {}", user_id, e);
                CancelOutcome::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::dto::STARTING_TOKENS;
    use async_trait::async_trait;
    use sema_core::helpers::dto::{ChatChannel, MessageContent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    enum ProviderMode {
        Reply(String),
        Fail(String),
        /// Block until a permit is released, then reply.
        Gated(Arc<Semaphore>, String),
    }

    struct MockProvider {
        mode: ProviderMode,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerProvider for MockProvider {
        async fn ask(
            &self,
            _history: &[ConversationTurn],
            _prompt: &str,
            _attachment_url: Option<&str>,
        ) -> Result<String, BotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                ProviderMode::Reply(text) => Ok(text.clone()),
                ProviderMode::Fail(reason) => Err(BotError::ProviderFailure(reason.clone())),
                ProviderMode::Gated(gate, text) => {
                    let _permit = gate.acquire().await.unwrap();
                    Ok(text.clone())
                }
            }
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        ledger: UserLedger,
        tracker: RequestTracker,
        provider: Arc<MockProvider>,
    }

    fn fixture(mode: ProviderMode) -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = UserLedger::new(&db).unwrap();
        let tracker = RequestTracker::new(&db, ledger.clone()).unwrap();
        let streaks = StreakTracker::new(ledger.clone());
        let provider = Arc::new(MockProvider {
            mode,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            ledger.clone(),
            tracker.clone(),
            streaks,
            provider.clone(),
        );
        Fixture {
            orchestrator,
            ledger,
            tracker,
            provider,
        }
    }

    fn text_message(message_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            channel: ChatChannel::Telegram,
            user_id: "tg:1".to_string(),
            display_name: "Ada".to_string(),
            message_id: message_id.to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn media_message(message_id: &str) -> InboundMessage {
        InboundMessage {
            channel: ChatChannel::Telegram,
            user_id: "tg:1".to_string(),
            display_name: "Ada".to_string(),
            message_id: message_id.to_string(),
            content: MessageContent::Media {
                url: "https://files.example/pic.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                caption: "what is this?".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_first_contact_gets_welcome_unbilled() {
        let f = fixture(ProviderMode::Reply("hi".into()));
        let outcome = f.orchestrator.answer(&text_message("m1", "hello")).await.unwrap();
        assert!(matches!(outcome, AnswerOutcome::Welcome));
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_text_answer_bills_once() {
        let f = fixture(ProviderMode::Reply("42".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();

        let outcome = f
            .orchestrator
            .answer(&text_message("m1", "meaning of life?"))
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::Reply { request_id, text } => {
                assert_eq!(text, "42");
                assert_eq!(
                    f.tracker.get(&request_id).unwrap().status,
                    RequestStatus::Completed
                );
            }
            other => panic!("expected reply, got {:?}", other),
        }

        let user = f.ledger.get_required("tg:1").unwrap();
        assert_eq!(user.token_balance, STARTING_TOKENS - 1);
        // One user turn, one assistant turn.
        assert_eq!(user.conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_media_costs_two_and_fails_closed() {
        let f = fixture(ProviderMode::Reply("a cat".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();
        f.ledger.debit("tg:1", STARTING_TOKENS - 1).unwrap(); // balance 1

        let outcome = f.orchestrator.answer(&media_message("m1")).await.unwrap();
        assert!(matches!(
            outcome,
            AnswerOutcome::InsufficientTokens { have: 1, need: 2 }
        ));
        // No record, no debit, provider untouched.
        assert!(matches!(
            f.tracker.get("tg:1:m1"),
            Err(BotError::NotFound)
        ));
        assert_eq!(f.ledger.get_required("tg:1").unwrap().token_balance, 1);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_dropped_silently() {
        let f = fixture(ProviderMode::Reply("pong".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();

        let first = f.orchestrator.answer(&text_message("m1", "ping")).await.unwrap();
        assert!(matches!(first, AnswerOutcome::Reply { .. }));

        let second = f.orchestrator.answer(&text_message("m1", "ping")).await.unwrap();
        assert!(matches!(second, AnswerOutcome::Dropped));

        // Exactly one debit and one provider call.
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS - 1
        );
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_balance_drain_stays_silent() {
        let f = fixture(ProviderMode::Reply("pong".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();
        f.ledger.debit("tg:1", STARTING_TOKENS - 1).unwrap(); // balance 1

        let first = f.orchestrator.answer(&text_message("m1", "ping")).await.unwrap();
        assert!(matches!(first, AnswerOutcome::Reply { .. }));
        assert_eq!(f.ledger.get_required("tg:1").unwrap().token_balance, 0);

        // The balance is now below cost, but a second delivery of m1 is a
        // duplicate and must not surface a new reply of any kind.
        let second = f.orchestrator.answer(&text_message("m1", "ping")).await.unwrap();
        assert!(matches!(second, AnswerOutcome::Dropped));
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);

        // A genuinely new message with no balance still gets the notice.
        let third = f.orchestrator.answer(&text_message("m2", "ping")).await.unwrap();
        assert!(matches!(
            third,
            AnswerOutcome::InsufficientTokens { have: 0, need: 1 }
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_refunds_exactly() {
        let f = fixture(ProviderMode::Fail("upstream 500".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();

        let outcome = f.orchestrator.answer(&text_message("m1", "hi")).await.unwrap();
        match outcome {
            AnswerOutcome::Refunded { reason } => assert!(reason.contains("upstream 500")),
            other => panic!("expected refund, got {:?}", other),
        }

        let user = f.ledger.get_required("tg:1").unwrap();
        assert_eq!(user.token_balance, STARTING_TOKENS);
        assert!(user.conversation.is_empty());
        let record = f.tracker.get("tg:1:m1").unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert!(record.error.unwrap().contains("upstream 500"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_wins_over_late_completion() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ProviderMode::Gated(gate.clone(), "too late".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();

        let orchestrator = f.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator.answer(&text_message("m1", "slow one")).await
        });

        // Wait until the request record exists and is processing.
        let record_id = "tg:1:m1";
        loop {
            match f.tracker.get(record_id) {
                Ok(record) if record.status == RequestStatus::Processing => break,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }

        // User cancels while the provider hangs; refund happens here, once.
        let cancel = f.orchestrator.cancel(record_id, "tg:1");
        assert!(matches!(cancel, CancelOutcome::Cancelled { refunded: 1 }));
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS
        );

        // Provider finally returns; the answer must be discarded, the record
        // stays cancelled, and no second refund lands.
        gate.add_permits(1);
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, AnswerOutcome::Dropped));

        let user = f.ledger.get_required("tg:1").unwrap();
        assert_eq!(user.token_balance, STARTING_TOKENS);
        assert!(user.conversation.is_empty());
        assert_eq!(
            f.tracker.get(record_id).unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_a_noop() {
        let f = fixture(ProviderMode::Reply("done".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();
        f.orchestrator.answer(&text_message("m1", "hi")).await.unwrap();

        let outcome = f.orchestrator.cancel("tg:1:m1", "tg:1");
        assert!(matches!(
            outcome,
            CancelOutcome::AlreadyFinished { ref status } if status == "completed"
        ));
        // Completed request stays billed.
        assert_eq!(
            f.ledger.get_required("tg:1").unwrap().token_balance,
            STARTING_TOKENS - 1
        );
    }

    #[tokio::test]
    async fn test_cancel_latest_without_inflight_request() {
        let f = fixture(ProviderMode::Reply("x".into()));
        f.ledger.create_if_absent("tg:1", "Ada").unwrap();
        assert!(matches!(
            f.orchestrator.cancel_latest("tg:1"),
            CancelOutcome::NotFound
        ));
    }
}
