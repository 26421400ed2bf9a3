use sema_core::helpers::utils::now_ts;
use tokio_cron_scheduler::Job;

use crate::dependencies::BotDeps;
use crate::requests::dto::REQUEST_RETENTION_SECS;

/// Daily at 06:00 UTC: drop lapsed streaks, then remind everyone whose live
/// streak is at risk today.
pub fn job_streak_maintenance(bot_deps: BotDeps) -> Job {
    Job::new_async("0 0 6 * * *", move |_uuid, _l| {
        let bot_deps = bot_deps.clone();
        Box::pin(async move {
            let now = now_ts();
            match bot_deps.streaks.reset_lapsed(now) {
                Ok(count) => log::info!("streak maintenance: {} streak(s) reset", count),
                Err(e) => log::error!("streak reset sweep failed: {}", e),
            }
            match bot_deps.streaks.remind_pending(now, &bot_deps.transports).await {
                Ok(count) => log::info!("streak maintenance: {} reminder(s) sent", count),
                Err(e) => log::error!("streak reminder sweep failed: {}", e),
            }
        })
    })
    .expect("Failed to create streak maintenance job")
}

/// Every 10 minutes: pending transactions past their expiry become failed.
pub fn job_expire_transactions(bot_deps: BotDeps) -> Job {
    Job::new_async("0 */10 * * * *", move |_uuid, _l| {
        let bot_deps = bot_deps.clone();
        Box::pin(async move {
            match bot_deps.reconciler.expire_pending(now_ts()) {
                Ok(0) => {}
                Ok(count) => log::info!("expired {} stale pending transaction(s)", count),
                Err(e) => log::error!("transaction expiry sweep failed: {}", e),
            }
        })
    })
    .expect("Failed to create transaction expiry job")
}

/// Hourly: settled request records past retention get purged. Retention is
/// audit-only; dedup correctness never depends on this sweep.
pub fn job_purge_requests(bot_deps: BotDeps) -> Job {
    Job::new_async("0 30 * * * *", move |_uuid, _l| {
        let bot_deps = bot_deps.clone();
        Box::pin(async move {
            let cutoff = now_ts() - REQUEST_RETENTION_SECS;
            match bot_deps.tracker.purge_older_than(cutoff) {
                Ok(0) => {}
                Ok(count) => log::info!("purged {} old request record(s)", count),
                Err(e) => log::error!("request purge sweep failed: {}", e),
            }
        })
    })
    .expect("Failed to create request purge job")
}
