//! Background job scheduling

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::Config;
use crate::services::RetentionService;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    retention: Arc<RetentionService>,
    config: &Config,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Retention sweep
    let sweeper = retention.clone();
    let retention_job = Job::new_async(config.retention_schedule.as_str(), move |_uuid, _l| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            info!("Running retention sweep");
            match sweeper.sweep().await {
                Ok(reports) => info!(collections = reports.len(), "Retention sweep finished"),
                Err(e) => tracing::error!("Retention sweep error: {}", e),
            }
        })
    })?;
    scheduler.add(retention_job).await?;

    // Retry remote deletes of collections left empty
    let cleaner = retention.clone();
    let cleanup_job = Job::new_async(config.cleanup_schedule.as_str(), move |_uuid, _l| {
        let cleaner = cleaner.clone();
        Box::pin(async move {
            if let Err(e) = cleaner.cleanup_empty().await {
                tracing::error!("Empty collection cleanup error: {}", e);
            }
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
