//! billsync Background Worker
//!
//! Handles scheduled jobs:
//! - Reconciliation sweep over every linked profile (hourly by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use billsync_billing::{BillingService, SweepReport, DEFAULT_SWEEP_BATCH_SIZE};
use billsync_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 0 * * * *";

fn log_sweep_report(report: &SweepReport) {
    if report.failed > 0 {
        warn!(
            scanned = report.scanned,
            reconciled = report.reconciled,
            changed = report.changed,
            failed = report.failed,
            "Reconciliation sweep finished with failures"
        );
    } else {
        info!(
            scanned = report.scanned,
            reconciled = report.reconciled,
            changed = report.changed,
            "Reconciliation sweep complete"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting billsync Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;

    let batch_size = match std::env::var("SWEEP_BATCH_SIZE") {
        Ok(value) => value
            .trim()
            .parse::<i64>()
            .context("SWEEP_BATCH_SIZE must be a whole number")?,
        Err(_) => DEFAULT_SWEEP_BATCH_SIZE,
    };
    let sweep_cron =
        std::env::var("SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());

    let billing = Arc::new(BillingService::from_env(pool)?.with_sweep_batch_size(batch_size));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation sweep
    // Repairs snapshots left stale by webhook side effects that failed after the claim
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running reconciliation sweep");
                match billing.sweep.run().await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Reconciliation sweep aborted"),
                }
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, batch_size = batch_size, "Scheduled: Reconciliation sweep");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("billsync Worker started with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
