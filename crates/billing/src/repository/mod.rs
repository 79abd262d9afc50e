//! Persistence for platform fee invoices and attempts
//!
//! Every mutation is a conditional write. Schedulers on different replicas
//! coordinate only through these conditions, never through locks held across
//! the external debit.
//!
//! A repository built with an outbox writes the [`PlatformFeeEvent`] for each
//! transition in the same unit of work as the transition itself.
//!
//! [`PlatformFeeEvent`]: crate::events::PlatformFeeEvent

mod memory;
mod postgres;

pub use memory::InMemoryFeeRepository;
pub use postgres::PgFeeRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{InvoiceRecord, NewAttempt, PlatformFeeAttempt, PlatformFeeInvoice};
use crate::policy::BillingPeriod;

#[async_trait]
pub trait FeeRepository: Send + Sync {
    /// Whether transitions already record their events in an outbox
    fn writes_outbox(&self) -> bool {
        false
    }

    /// Insert one invoice per priced user for the period, skipping users that
    /// already have one. Returns only the rows created by this call.
    async fn create_invoices_for_period(
        &self,
        period: &BillingPeriod,
    ) -> BillingResult<Vec<PlatformFeeInvoice>>;

    /// Open invoices inside `[due_at, grace_until]` with no successful attempt
    /// and no attempt since `attempted_before`.
    ///
    /// Ordered by `(due_at, id)`; `after` resumes strictly past that key so a
    /// caller can page through every candidate.
    async fn find_chargeable_invoices(
        &self,
        now: DateTime<Utc>,
        attempted_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> BillingResult<Vec<PlatformFeeInvoice>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<PlatformFeeInvoice>>;

    /// Take the attempt slot for the window starting at `window_start`.
    ///
    /// Succeeds only while the invoice is open, has no successful attempt, and
    /// was not attempted since `window_start`. Stamps `last_attempt_at = now` and
    /// bumps `retry_count`. `None` means another caller got there first.
    async fn claim_invoice_attempt(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>>;

    async fn insert_attempt(&self, attempt: &NewAttempt) -> BillingResult<PlatformFeeAttempt>;

    /// Settle from pending, failed or delinquent. `None` when already terminal.
    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
        provider_reference: &str,
    ) -> BillingResult<Option<PlatformFeeInvoice>>;

    /// Record a failed debit. Only applies while pending or failed.
    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>>;

    /// Move every grace-expired open invoice without a successful attempt to delinquent
    async fn mark_delinquent(&self, now: DateTime<Utc>) -> BillingResult<Vec<PlatformFeeInvoice>>;

    async fn latest_invoice_for_user(&self, user_id: Uuid) -> BillingResult<Option<InvoiceRecord>>;

    /// Newest period first
    async fn list_invoices_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>>;

    async fn list_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PlatformFeeAttempt>>;
}
