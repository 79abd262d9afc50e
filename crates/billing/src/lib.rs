// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Transfa Platform Fee Billing
//!
//! Recurring platform-fee state machine for wallet users.
//!
//! ## Features
//!
//! - **Invoice Generation**: One invoice per user per calendar month, priced from `platform_fee_config`
//! - **Charge Attempts**: Debits on fixed day offsets after the due date, one per window
//! - **Delinquency**: Unpaid invoices past grace become delinquent
//! - **Status**: Self-healing reads that trust successful attempt rows
//! - **Events**: `platform_fee.{due,paid,failed,delinquent}` published directly or written to the outbox with each transition
//! - **Invariants**: Read-only consistency checks for operators

pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod models;
pub mod policy;
pub mod repository;
pub mod service;
pub mod transaction;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use sqlx::PgPool;
use transfa_shared::{AmqpPublisher, EventPublisher, NoopPublisher};

// Config
pub use config::{BillingConfig, EventDelivery};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEventPublisher, PlatformFeeEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    AttemptStatus, InvoiceStatus, InvoiceView, PlatformFeeAttempt, PlatformFeeInvoice,
    PlatformFeeStatus,
};

// Policy
pub use policy::{AttemptWindow, AttemptWindowPolicy, BillingPeriod, BusinessCalendar};

// Repository
pub use repository::{FeeRepository, InMemoryFeeRepository, PgFeeRepository};

// Service
pub use service::{
    ChargeOutcome, ChargeRunSummary, DelinquencySummary, FeeSchedule, GenerationSummary,
    InvoiceDetail, PlatformFeeService,
};

// Transaction
pub use transaction::{DebitError, HttpTransactionClient, TransactionClient};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub fees: PlatformFeeService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables.
    ///
    /// With `BILLING_EVENT_DELIVERY=outbox` events are written to `event_outbox`
    /// in the transaction of the transition they announce; otherwise they go
    /// straight to the broker, or nowhere if it is unreachable.
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;

        let publisher: Arc<dyn EventPublisher> = match config.event_delivery {
            EventDelivery::Outbox => Arc::new(NoopPublisher),
            EventDelivery::Direct => {
                AmqpPublisher::connect_or_noop(config.amqp_url.as_deref()).await
            }
        };

        tracing::info!(
            timezone = %config.timezone,
            delivery = ?config.event_delivery,
            exchange = %config.events_exchange,
            "Billing service configured"
        );

        Self::new(config, pool, publisher)
    }

    /// Create a new billing service with explicit config.
    ///
    /// `publisher` is only used for direct delivery.
    pub fn new(
        config: BillingConfig,
        pool: PgPool,
        publisher: Arc<dyn EventPublisher>,
    ) -> BillingResult<Self> {
        let transactions = HttpTransactionClient::new(
            &config.transaction_service_url,
            &config.internal_api_key,
            config.debit_timeout,
        )
        .map_err(|e| BillingError::Config(e.to_string()))?;

        let repo = match config.event_delivery {
            EventDelivery::Outbox => {
                PgFeeRepository::with_outbox(pool.clone(), config.events_exchange.clone())
            }
            EventDelivery::Direct => PgFeeRepository::new(pool.clone()),
        };

        let fees = PlatformFeeService::new(
            Arc::new(repo),
            Arc::new(transactions),
            BillingEventPublisher::new(publisher, config.events_exchange.clone()),
            FeeSchedule::from_config(&config),
        );

        Ok(Self {
            fees,
            invariants: InvariantChecker::new(pool),
        })
    }
}
