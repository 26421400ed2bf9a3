use crate::ledger::handler::UserLedger;
use crate::orchestrator::handler::Orchestrator;
use crate::payments::handler::PaymentReconciler;
use crate::requests::handler::RequestTracker;
use crate::streaks::handler::StreakTracker;
use crate::transport::Transports;

/// Everything the dispatch tree, the webhook router and the cron jobs need,
/// cloned freely into each handler.
#[derive(Clone)]
pub struct BotDeps {
    pub ledger: UserLedger,
    pub tracker: RequestTracker,
    pub orchestrator: Orchestrator,
    pub reconciler: PaymentReconciler,
    pub streaks: StreakTracker,
    pub transports: Transports,
    /// `https://api.telegram.org/file/bot<token>` for photo attachment urls.
    pub telegram_file_base: String,
}
