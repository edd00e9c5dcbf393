#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Billflow Background Worker
//!
//! Runs the retry-job loop plus scheduled maintenance:
//! - Job claim/dispatch polling (every second when idle)
//! - Purge of succeeded jobs and settled webhook events (daily at 03:00 UTC)
//! - Daily queue-health report by email, when SMTP is configured
//! - Heartbeat log line (every 5 minutes)

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use billflow_billing::{BillingService, ReportMailer};
use billflow_shared::db::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

const CLAIM_BATCH: i64 = 10;
const IDLE_SLEEP: Duration = Duration::from_secs(1);
const ERROR_SLEEP: Duration = Duration::from_secs(5);

const JOB_RETENTION_DAYS: i64 = 30;
const WEBHOOK_RETENTION_DAYS: i64 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Billflow worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let worker_id = format!("worker-{}", Uuid::new_v4());
    info!(worker_id = %worker_id, "Worker identity assigned");

    start_maintenance(billing.clone()).await?;

    // Main claim/dispatch loop. This loop never exits and never panics the
    // process: queue errors back off, handler errors feed the retry logic.
    loop {
        let batch = match billing.jobs.claim(&worker_id, CLAIM_BATCH).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Job claim failed, backing off");
                tokio::time::sleep(ERROR_SLEEP).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        info!(count = batch.len(), "Claimed jobs");

        // Serial dispatch: one slow handler delays the batch, but handlers
        // never contend with each other for the same subscription rows.
        for job in &batch {
            match handlers::dispatch(&billing, &pool, job).await {
                Ok(()) => {
                    if let Err(e) = billing.jobs.complete(job.id).await {
                        error!(job_id = %job.id, error = %e, "Failed to mark job complete");
                    }
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        retryable = retryable,
                        error = %e,
                        "Job handler failed"
                    );
                    if let Err(fail_err) =
                        billing.jobs.fail(job, &e.to_string(), retryable).await
                    {
                        error!(job_id = %job.id, error = %fail_err, "Failed to record job failure");
                    }
                }
            }
        }
    }
}

/// Cron-scheduled maintenance jobs.
async fn start_maintenance(billing: Arc<BillingService>) -> anyhow::Result<()> {
    let scheduler = JobScheduler::new().await?;

    let purge_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_, _| {
            let billing = purge_billing.clone();
            Box::pin(async move {
                match billing.jobs.purge_succeeded(JOB_RETENTION_DAYS).await {
                    Ok(purged) => info!(purged = purged, "Purged succeeded jobs"),
                    Err(e) => error!(error = %e, "Job purge failed"),
                }
                match billing.webhooks.purge_old(WEBHOOK_RETENTION_DAYS).await {
                    Ok(purged) => info!(purged = purged, "Purged settled webhook events"),
                    Err(e) => error!(error = %e, "Webhook event purge failed"),
                }
            })
        })?)
        .await?;

    let recipient = std::env::var("REPORT_RECIPIENT")
        .ok()
        .filter(|v| !v.is_empty());
    match (billing.mailer.clone(), recipient) {
        (Some(mailer), Some(recipient)) => {
            let report_billing = billing.clone();
            scheduler
                .add(Job::new_async("0 30 6 * * *", move |_, _| {
                    let billing = report_billing.clone();
                    let mailer = mailer.clone();
                    let recipient = recipient.clone();
                    Box::pin(async move {
                        if let Err(e) = send_queue_report(&billing, &mailer, &recipient).await {
                            error!(error = %e, "Daily queue report failed");
                        }
                    })
                })?)
                .await?;
        }
        _ => {
            info!("Daily queue report disabled, SMTP or REPORT_RECIPIENT not configured");
        }
    }

    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_, _| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Maintenance scheduler started");
    Ok(())
}

async fn send_queue_report(
    billing: &BillingService,
    mailer: &ReportMailer,
    recipient: &str,
) -> anyhow::Result<()> {
    let job_counts = billing.jobs.status_counts().await?;
    let event_counts = billing.webhooks.status_counts().await?;
    let body = queue_report_body(&job_counts, &event_counts);
    mailer
        .send(recipient, "Billflow daily queue report", &body)
        .await?;
    Ok(())
}

/// Plain-text report body: one status-count line per section.
fn queue_report_body(job_counts: &[(String, i64)], event_counts: &[(String, i64)]) -> String {
    let mut body = String::new();
    for (title, counts) in [
        ("Retry jobs by status:", job_counts),
        ("Webhook events by status:", event_counts),
    ] {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(title);
        body.push('\n');
        if counts.is_empty() {
            body.push_str("  (none)\n");
        }
        for (status, count) in counts {
            body.push_str(&format!("  {}: {}\n", status, count));
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_report_lists_counts_per_section() {
        let jobs = vec![("FAILED".to_string(), 2), ("PENDING".to_string(), 14)];
        let events = vec![("PROCESSED".to_string(), 120)];
        let body = queue_report_body(&jobs, &events);
        assert_eq!(
            body,
            "Retry jobs by status:\n  FAILED: 2\n  PENDING: 14\n\n\
             Webhook events by status:\n  PROCESSED: 120\n"
        );
    }

    #[test]
    fn queue_report_handles_empty_tables() {
        let body = queue_report_body(&[], &[]);
        assert!(body.contains("Retry jobs by status:\n  (none)"));
        assert!(body.contains("Webhook events by status:\n  (none)"));
    }
}
