//! Hostara Background Worker
//!
//! Handles scheduled billing jobs:
//! - Server renewal sweep (hourly)
//! - Overdue invoice check (daily at 0:30 UTC)
//! - Pending payment reconciliation (every 15 minutes)
//! - Health check heartbeat (every 5 minutes)

mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use hostara_billing::{
    BillingEmailService, InvoiceService, PaymentConfirmationService, PaymentGatewayService,
    RenewalService,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Hostara Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    let email = BillingEmailService::from_env();
    let renewal = RenewalService::new(pool.clone(), email.clone());
    let invoices = InvoiceService::new(pool.clone());

    // Payment rails are optional for the worker: without them the sweep and
    // invoice jobs still run, only reconciliation is skipped.
    let gateway = match PaymentGatewayService::from_env(pool.clone()) {
        Ok(g) => Some(Arc::new(g)),
        Err(e) => {
            warn!(error = %e, "Payment rails not configured - reconciliation job disabled");
            None
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Server renewal sweep (hourly)
    // Renews, suspends, warns, and terminates based on expiry and balance
    let sweep_renewal = renewal.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let renewal = sweep_renewal.clone();
            Box::pin(async move {
                info!("Running server renewal sweep");
                let summary = renewal.run_sweep().await;
                if !summary.errors.is_empty() {
                    for e in &summary.errors {
                        error!(server_id = %e.server_id, error = %e.error, "Sweep error");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Server renewal sweep (hourly)");

    // Job 2: Overdue invoice check (daily at 0:30 UTC)
    let overdue_invoices = invoices.clone();
    scheduler
        .add(Job::new_async("0 30 0 * * *", move |_uuid, _l| {
            let invoices = overdue_invoices.clone();
            Box::pin(async move {
                info!("Running overdue invoice check");
                match invoices.check_overdue_invoices().await {
                    Ok(flipped) => info!(flipped = flipped, "Overdue invoice check complete"),
                    Err(e) => error!(error = %e, "Overdue invoice check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue invoice check (daily at 0:30 UTC)");

    // Job 3: Pending payment reconciliation (every 15 minutes)
    // Polls provider status for deposits whose webhooks never arrived
    if let Some(gateway) = gateway {
        let confirmation = PaymentConfirmationService::new(pool.clone());
        let reconcile_email = email.clone();
        scheduler
            .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                let gateway = gateway.clone();
                let confirmation = confirmation.clone();
                let email = reconcile_email.clone();
                Box::pin(async move {
                    reconcile::reconcile_pending_payments(&gateway, &confirmation, &email).await;
                })
            })?)
            .await?;
        info!("Scheduled: Pending payment reconciliation (every 15 minutes)");
    }

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

    info!("Hostara Worker started successfully");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
