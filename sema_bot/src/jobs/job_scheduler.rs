use anyhow::Result;
use tokio_cron_scheduler::JobScheduler;

use crate::dependencies::BotDeps;
use crate::jobs::handler::{job_expire_transactions, job_purge_requests, job_streak_maintenance};

pub async fn schedule_jobs(bot_deps: BotDeps) -> Result<()> {
    log::info!("Initializing job scheduler...");

    let scheduler = match JobScheduler::new().await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            log::error!("Failed to create job scheduler: {}", e);
            return Err(anyhow::anyhow!("Failed to create job scheduler: {}", e));
        }
    };

    if let Err(e) = scheduler.add(job_streak_maintenance(bot_deps.clone())).await {
        return Err(anyhow::anyhow!("Failed to add streak maintenance job: {}", e));
    }
    if let Err(e) = scheduler.add(job_expire_transactions(bot_deps.clone())).await {
        return Err(anyhow::anyhow!("Failed to add transaction expiry job: {}", e));
    }
    if let Err(e) = scheduler.add(job_purge_requests(bot_deps)).await {
        return Err(anyhow::anyhow!("Failed to add request purge job: {}", e));
    }

    if let Err(e) = scheduler.start().await {
        log::error!("Failed to start job scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to start scheduler: {}", e));
    }

    log::info!("All jobs scheduled successfully");
    Ok(())
}
