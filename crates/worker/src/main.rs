//! creditsync Background Worker
//!
//! Handles scheduled jobs including:
//! - Replay of failed webhook deliveries (every 10 minutes)
//! - Expiry sweep of lapsed grants (hourly)
//! - Grant invariant checks (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)
//!
//! One-off maintenance runs as a subcommand instead of starting the scheduler:
//!
//! ```text
//! creditsync-worker replay <delivery-id>
//! creditsync-worker reset <delivery-id>
//! creditsync-worker replay-failed
//! creditsync-worker check-invariants
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use creditsync_billing::{
    BillingService, InvariantCheckSummary, SweepReport, ViolationSeverity, WebhookReplayResult,
};
use creditsync_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_REPLAY_BATCH_SIZE: i64 = 50;
const WORKER_MAX_CONNECTIONS: u32 = 5;

fn replay_batch_size() -> i64 {
    std::env::var("REPLAY_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n: &i64| *n > 0)
        .unwrap_or(DEFAULT_REPLAY_BATCH_SIZE)
}

/// Log results of a replay batch
fn log_replay_results(results: &[WebhookReplayResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    info!(
        replayed = results.len(),
        succeeded = succeeded,
        failed = failed,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            delivery_id = %result.delivery_id,
            event_type = %result.event_type,
            error = ?result.new_error,
            "Webhook delivery still failing after replay"
        );
    }
}

fn log_sweep_report(report: &SweepReport) {
    info!(
        examined = report.examined,
        expired = report.expired,
        conflicts = report.conflicts,
        "Expiry sweep complete"
    );
}

/// Log invariant violations at a level matching their severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }

    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant checks complete"
    );
}

/// Run a maintenance subcommand. Returns `false` when no subcommand was given.
async fn run_command(billing: &BillingService, args: &[String]) -> anyhow::Result<bool> {
    match args {
        [] => Ok(false),
        [cmd, delivery_id] if cmd == "replay" => {
            let result = billing.webhooks.replay_delivery(delivery_id).await?;
            info!(
                delivery_id = %result.delivery_id,
                previous_status = %result.previous_status,
                new_status = %result.new_status,
                success = result.success,
                "Replay finished"
            );
            Ok(true)
        }
        [cmd, delivery_id] if cmd == "reset" => {
            billing.webhooks.reset_stuck(delivery_id).await?;
            Ok(true)
        }
        [cmd] if cmd == "replay-failed" => {
            let results = billing
                .webhooks
                .replay_all_failed(Some(replay_batch_size()))
                .await?;
            log_replay_results(&results);
            Ok(true)
        }
        [cmd] if cmd == "check-invariants" => {
            let summary = billing.invariants.run_all_checks().await?;
            log_invariant_summary(&summary);
            Ok(true)
        }
        other => anyhow::bail!("unknown command: {}", other.join(" ")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting creditsync Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, WORKER_MAX_CONNECTIONS).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool).await?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if run_command(&billing, &args).await? {
        return Ok(());
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay failed deliveries every 10 minutes
    let batch_size = replay_batch_size();
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                match billing.webhooks.replay_all_failed(Some(batch_size)).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_replay_results(&results),
                    Err(e) => error!(error = %e, "Failed to list deliveries for replay"),
                }
            })
        })?)
        .await?;
    info!(batch_size = batch_size, "Scheduled: Failed delivery replay (every 10 minutes)");

    // Job 2: Expire lapsed grants (hourly)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running expiry sweep");
                match billing.sweep.run(OffsetDateTime::now_utc()).await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (hourly)");

    // Job 3: Invariant checks (daily at 4:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running grant invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 4:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("creditsync Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
