#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Transfa Billing Worker
//!
//! Runs the platform fee jobs:
//! - Monthly invoice generation (idempotent, daily by default)
//! - Charge attempts on the allowed day offsets (hourly by default)
//! - Delinquency marking once grace expires (hourly by default)
//! - Outbox dispatch to the broker (continuous)

mod config;
mod scheduler;

use std::sync::Arc;

use tracing::{error, info, warn};
use transfa_billing::BillingService;
use transfa_shared::{
    create_pool, init_tracing, AmqpPublisher, DispatcherConfig, OutboxDispatcher, PgOutboxStore,
};

use crate::config::WorkerConfig;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing("info,transfa_worker=debug,transfa_billing=debug");

    info!("Starting Transfa Billing Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool.clone()).await?);
    let mut scheduler = Scheduler::new().await?;

    // Job 1: Generate last month's invoices
    let service = billing.clone();
    scheduler
        .add("generate_invoices", &config.generate, move |_cancel| {
            let service = service.clone();
            Box::pin(async move {
                match service.fees.generate_monthly_invoices().await {
                    Ok(summary) => info!(
                        created = summary.created,
                        period_start = %summary.period_start,
                        period_end = %summary.period_end,
                        "Invoice generation complete"
                    ),
                    Err(e) => error!(error = %e, "Invoice generation failed"),
                }
            })
        })
        .await?;

    // Job 2: Charge attempts for invoices in an open window
    let service = billing.clone();
    scheduler
        .add("charge_attempts", &config.charge, move |cancel| {
            let service = service.clone();
            Box::pin(async move {
                match service.fees.run_charge_attempts_until(&cancel).await {
                    Ok(summary) => info!(
                        candidates = summary.candidates,
                        outside_window = summary.outside_window,
                        already_claimed = summary.already_claimed,
                        paid = summary.paid,
                        failed = summary.failed,
                        errors = summary.errors,
                        interrupted = summary.interrupted,
                        "Charge attempt cycle complete"
                    ),
                    Err(e) => error!(error = %e, "Charge attempt cycle failed"),
                }
            })
        })
        .await?;

    // Job 3: Mark invoices past grace as delinquent
    let service = billing.clone();
    scheduler
        .add("mark_delinquent", &config.delinquency, move |_cancel| {
            let service = service.clone();
            Box::pin(async move {
                match service.fees.mark_delinquent().await {
                    Ok(summary) if summary.marked > 0 => {
                        warn!(marked = summary.marked, "Invoices marked delinquent")
                    }
                    Ok(_) => info!("No invoices past grace"),
                    Err(e) => error!(error = %e, "Delinquency run failed"),
                }
            })
        })
        .await?;

    // Outbox dispatch always goes to the real broker; without one rows accumulate
    match (config.dispatcher_enabled, config.amqp_url.as_deref()) {
        (true, Some(url)) => {
            let dispatcher = Arc::new(OutboxDispatcher::new(
                Arc::new(PgOutboxStore::new(pool.clone())),
                Arc::new(AmqpPublisher::new(url)),
                DispatcherConfig::from_env(),
            ));
            scheduler.spawn_service("outbox_dispatcher", move |cancel| async move {
                dispatcher.run(cancel).await
            });
        }
        (true, None) => {
            warn!("AMQP_URL not set - outbox dispatcher disabled, events will accumulate");
        }
        (false, _) => info!("Outbox dispatcher disabled by configuration"),
    }

    scheduler.start().await?;
    info!("Worker started");

    shutdown_signal().await;

    info!("Shutting down worker");
    scheduler.shutdown().await;
    pool.close().await;
    info!("Worker stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
