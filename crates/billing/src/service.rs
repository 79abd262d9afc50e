//! Platform fee billing engine
//!
//! Generates monthly invoices, runs bounded-retry debit attempts on the
//! configured day offsets, and drives every invoice to paid or delinquent.
//! Safe to run from any number of schedulers at once: each invoice transition is
//! gated by a conditional write in the [`FeeRepository`].

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventPublisher, PlatformFeeEvent};
use crate::models::{
    AttemptStatus, InvoiceView, NewAttempt, PlatformFeeAttempt, PlatformFeeInvoice,
    PlatformFeeStatus,
};
use crate::policy::{AttemptWindow, AttemptWindowPolicy, BusinessCalendar};
use crate::repository::FeeRepository;
use crate::transaction::TransactionClient;

/// Default and maximum page size for invoice history
pub const DEFAULT_HISTORY_LIMIT: i64 = 12;
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// Provider reference recorded when a zero-amount invoice settles without a debit
pub const ZERO_AMOUNT_REFERENCE: &str = "zero-amount";

/// Calendar and cadence rules for platform fees
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub calendar: BusinessCalendar,
    pub due_offset: Duration,
    pub grace_period: Duration,
    pub attempt_policy: AttemptWindowPolicy,
    pub charge_batch_size: i64,
}

impl FeeSchedule {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            calendar: BusinessCalendar::load(&config.timezone),
            due_offset: config.due_offset,
            grace_period: config.grace_period,
            attempt_policy: AttemptWindowPolicy::new(config.attempt_day_offsets.clone()),
            charge_batch_size: config.charge_batch_size,
        }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            calendar: BusinessCalendar::utc(),
            due_offset: Duration::minutes(crate::config::DEFAULT_DUE_OFFSET_MINUTES),
            grace_period: Duration::days(crate::config::DEFAULT_GRACE_DAYS),
            attempt_policy: AttemptWindowPolicy::default(),
            charge_batch_size: crate::config::DEFAULT_CHARGE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub created: usize,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChargeRunSummary {
    pub candidates: usize,
    /// Skipped because today is not an allowed day offset
    pub outside_window: usize,
    /// Another scheduler already took this window
    pub already_claimed: usize,
    pub paid: usize,
    pub failed: usize,
    pub errors: usize,
    /// Shutdown was requested before every candidate was visited
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Paid {
        invoice_id: Uuid,
        provider_reference: String,
    },
    Failed {
        invoice_id: Uuid,
        reason: String,
    },
    /// The claim matched nothing: attempted this window, settled, or no longer open
    NotClaimed { invoice_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DelinquencySummary {
    pub marked: usize,
}

/// Invoice plus its attempt history, for operators
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    pub invoice: InvoiceView,
    pub user_id: Uuid,
    pub attempts: Vec<PlatformFeeAttempt>,
}

#[derive(Clone)]
pub struct PlatformFeeService {
    repo: Arc<dyn FeeRepository>,
    transactions: Arc<dyn TransactionClient>,
    events: BillingEventPublisher,
    schedule: FeeSchedule,
}

impl PlatformFeeService {
    pub fn new(
        repo: Arc<dyn FeeRepository>,
        transactions: Arc<dyn TransactionClient>,
        events: BillingEventPublisher,
        schedule: FeeSchedule,
    ) -> Self {
        Self {
            repo,
            transactions,
            events,
            schedule,
        }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    /// Hand an event to the publisher unless the repository already wrote it
    /// to the outbox together with the transition.
    async fn announce(&self, event: PlatformFeeEvent) {
        if !self.repo.writes_outbox() {
            self.events.emit(&event).await;
        }
    }

    // =========================================================================
    // Invoice generation
    // =========================================================================

    /// Invoice the previous calendar month. Idempotent.
    pub async fn generate_monthly_invoices(&self) -> BillingResult<GenerationSummary> {
        self.generate_monthly_invoices_at(Utc::now()).await
    }

    pub async fn generate_monthly_invoices_at(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<GenerationSummary> {
        let period = self.schedule.calendar.previous_month(
            now,
            self.schedule.due_offset,
            self.schedule.grace_period,
        )?;

        let created = self.repo.create_invoices_for_period(&period).await?;

        for invoice in &created {
            self.announce(PlatformFeeEvent::due(invoice)).await;
        }

        info!(
            period_start = %period.period_start,
            period_end = %period.period_end,
            due_at = %period.due_at,
            created = created.len(),
            "Platform fee invoices generated"
        );

        Ok(GenerationSummary {
            created: created.len(),
            period_start: period.period_start,
            period_end: period.period_end,
        })
    }

    // =========================================================================
    // Charge attempts
    // =========================================================================

    pub async fn run_charge_attempts(&self) -> BillingResult<ChargeRunSummary> {
        self.run_charge_cycle(Utc::now(), &CancellationToken::new()).await
    }

    /// Like [`run_charge_attempts`](Self::run_charge_attempts) but stops between
    /// invoices once `cancel` fires.
    pub async fn run_charge_attempts_until(
        &self,
        cancel: &CancellationToken,
    ) -> BillingResult<ChargeRunSummary> {
        self.run_charge_cycle(Utc::now(), cancel).await
    }

    pub async fn run_charge_attempts_at(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<ChargeRunSummary> {
        self.run_charge_cycle(now, &CancellationToken::new()).await
    }

    /// One scheduler cycle over every chargeable invoice.
    ///
    /// Candidates are paged by `(due_at, id)` in batches of `charge_batch_size`
    /// and exclude invoices already attempted today, so a backlog of declined
    /// invoices cannot hide the rest. Per-invoice failures are counted and
    /// logged; only the candidate query can fail the run.
    pub async fn run_charge_cycle(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> BillingResult<ChargeRunSummary> {
        let calendar = &self.schedule.calendar;
        let attempted_before = calendar.start_of_day(calendar.local_date(now));
        let page_size = self.schedule.charge_batch_size.max(1);

        let mut summary = ChargeRunSummary::default();
        let mut after = None;

        'pages: loop {
            let page = self
                .repo
                .find_chargeable_invoices(now, attempted_before, after, page_size)
                .await?;
            let last_page = (page.len() as i64) < page_size;
            after = page.last().map(|invoice| (invoice.due_at, invoice.id));
            summary.candidates += page.len();

            for invoice in page {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break 'pages;
                }

                let window = self
                    .schedule
                    .attempt_policy
                    .window_for(calendar, invoice.due_at, now);

                let window_start = match window {
                    AttemptWindow::Open { window_start, .. } => window_start,
                    AttemptWindow::Closed { offset } => {
                        debug!(invoice_id = %invoice.id, day_offset = offset, "Outside attempt window");
                        summary.outside_window += 1;
                        continue;
                    }
                };

                match self.attempt(invoice.id, now, window_start).await {
                    Ok(ChargeOutcome::Paid { .. }) => summary.paid += 1,
                    Ok(ChargeOutcome::Failed { .. }) => summary.failed += 1,
                    Ok(ChargeOutcome::NotClaimed { .. }) => summary.already_claimed += 1,
                    Err(e) => {
                        error!(invoice_id = %invoice.id, error = %e, "Platform fee charge attempt errored");
                        summary.errors += 1;
                    }
                }
            }

            if last_page {
                break;
            }
        }

        info!(
            candidates = summary.candidates,
            outside_window = summary.outside_window,
            already_claimed = summary.already_claimed,
            paid = summary.paid,
            failed = summary.failed,
            errors = summary.errors,
            interrupted = summary.interrupted,
            "Platform fee charge cycle complete"
        );

        Ok(summary)
    }

    /// Operator-triggered attempt for one invoice.
    ///
    /// Uses the current business day as the window and ignores the day-offset
    /// cadence, so it cannot double charge with a scheduled attempt made today.
    /// An open invoice is only chargeable between `due_at` and `grace_until`.
    pub async fn charge_invoice(&self, invoice_id: Uuid) -> BillingResult<ChargeOutcome> {
        self.charge_invoice_at(invoice_id, Utc::now()).await
    }

    pub async fn charge_invoice_at(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<ChargeOutcome> {
        let invoice = self
            .repo
            .get_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if invoice.status.is_open() && (now < invoice.due_at || now > invoice.grace_until) {
            return Err(BillingError::InvalidInput(format!(
                "invoice {} is outside its charge window ({} to {})",
                invoice_id, invoice.due_at, invoice.grace_until
            )));
        }

        let calendar = &self.schedule.calendar;
        let window_start = calendar.start_of_day(calendar.local_date(now));
        self.attempt(invoice_id, now, window_start).await
    }

    /// Claim, debit, then record. The debit runs outside any transaction; the
    /// invoice id is passed as its idempotency key.
    async fn attempt(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> BillingResult<ChargeOutcome> {
        let Some(invoice) = self
            .repo
            .claim_invoice_attempt(invoice_id, now, window_start)
            .await?
        else {
            debug!(invoice_id = %invoice_id, "Invoice not claimable in this window");
            return Ok(ChargeOutcome::NotClaimed { invoice_id });
        };

        if invoice.amount == 0 {
            self.settle(&invoice, ZERO_AMOUNT_REFERENCE, now).await?;
            return Ok(ChargeOutcome::Paid {
                invoice_id,
                provider_reference: ZERO_AMOUNT_REFERENCE.to_string(),
            });
        }

        match self
            .transactions
            .debit_platform_fee(invoice.user_id, invoice.amount, invoice.id)
            .await
        {
            Ok(reference) => {
                self.settle(&invoice, &reference, now).await?;
                Ok(ChargeOutcome::Paid {
                    invoice_id,
                    provider_reference: reference,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.record_failure(&invoice, &reason, now).await?;
                Ok(ChargeOutcome::Failed { invoice_id, reason })
            }
        }
    }

    /// Attempt row first, then the invoice. A crash in between leaves a success
    /// row that reads as paid.
    async fn settle(
        &self,
        invoice: &PlatformFeeInvoice,
        reference: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let attempt = NewAttempt {
            invoice_id: invoice.id,
            attempted_at: now,
            amount: invoice.amount,
            status: AttemptStatus::Success,
            failure_reason: None,
            provider_reference: Some(reference.to_string()),
        };

        match self.repo.insert_attempt(&attempt).await {
            Ok(_) => {}
            Err(BillingError::ConcurrentModification(msg)) => {
                warn!(invoice_id = %invoice.id, reason = %msg, "Success attempt already recorded");
            }
            Err(e) => {
                error!(
                    invoice_id = %invoice.id,
                    provider_reference = %reference,
                    error = %e,
                    "Debit succeeded but the attempt could not be recorded"
                );
                return Err(e);
            }
        }

        match self.repo.mark_invoice_paid(invoice.id, now, reference).await? {
            Some(paid) => {
                info!(
                    invoice_id = %paid.id,
                    user_id = %paid.user_id,
                    amount = paid.amount,
                    provider_reference = %reference,
                    "Platform fee paid"
                );
                self.announce(PlatformFeeEvent::paid(&paid, now, reference))
                    .await;
            }
            None => {
                warn!(invoice_id = %invoice.id, "Invoice left its open state before it could be marked paid");
            }
        }

        Ok(())
    }

    async fn record_failure(
        &self,
        invoice: &PlatformFeeInvoice,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        self.repo
            .insert_attempt(&NewAttempt {
                invoice_id: invoice.id,
                attempted_at: now,
                amount: invoice.amount,
                status: AttemptStatus::Failed,
                failure_reason: Some(reason.to_string()),
                provider_reference: None,
            })
            .await?;

        match self.repo.mark_invoice_failed(invoice.id, reason, now).await? {
            Some(failed) => {
                warn!(
                    invoice_id = %failed.id,
                    user_id = %failed.user_id,
                    retry_count = failed.retry_count,
                    reason = %reason,
                    "Platform fee debit failed"
                );
                self.announce(PlatformFeeEvent::failed(&failed, reason))
                    .await;
            }
            None => {
                warn!(invoice_id = %invoice.id, "Invoice left its open state before failure could be recorded");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Delinquency
    // =========================================================================

    pub async fn mark_delinquent(&self) -> BillingResult<DelinquencySummary> {
        self.mark_delinquent_at(Utc::now()).await
    }

    pub async fn mark_delinquent_at(&self, now: DateTime<Utc>) -> BillingResult<DelinquencySummary> {
        let marked = self.repo.mark_delinquent(now).await?;

        for invoice in &marked {
            info!(invoice_id = %invoice.id, user_id = %invoice.user_id, "Platform fee invoice delinquent");
            self.announce(PlatformFeeEvent::delinquent(invoice)).await;
        }

        Ok(DelinquencySummary {
            marked: marked.len(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_status_by_user_id(&self, user_id: Uuid) -> BillingResult<PlatformFeeStatus> {
        self.get_status_by_user_id_at(user_id, Utc::now()).await
    }

    pub async fn get_status_by_user_id_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<PlatformFeeStatus> {
        let latest = self.repo.latest_invoice_for_user(user_id).await?;
        Ok(PlatformFeeStatus::from_latest(user_id, latest.as_ref(), now))
    }

    /// Newest first. `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    pub async fn list_invoices_for_user(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<InvoiceView>> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let now = Utc::now();
        let records = self.repo.list_invoices_for_user(user_id, limit).await?;
        Ok(records
            .iter()
            .map(|record| InvoiceView::derive(record, now))
            .collect())
    }

    pub async fn get_invoice_detail(&self, invoice_id: Uuid) -> BillingResult<InvoiceDetail> {
        let invoice = self
            .repo
            .get_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;
        let attempts = self.repo.list_attempts(invoice_id).await?;
        let has_success = attempts.iter().any(|a| a.status == AttemptStatus::Success);
        let user_id = invoice.user_id;
        let record = crate::models::InvoiceRecord {
            invoice,
            has_successful_attempt: has_success,
        };

        Ok(InvoiceDetail {
            invoice: InvoiceView::derive(&record, Utc::now()),
            user_id,
            attempts,
        })
    }
}
