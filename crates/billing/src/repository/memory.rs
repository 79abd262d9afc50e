//! In-memory fee repository for single-process runs and tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use transfa_shared::InMemoryOutboxStore;
use uuid::Uuid;

use super::FeeRepository;
use crate::error::{BillingError, BillingResult};
use crate::events::{event_payload, PlatformFeeEvent};
use crate::models::{
    AttemptStatus, InvoiceRecord, InvoiceStatus, NewAttempt, PlatformFeeAttempt,
    PlatformFeeConfig, PlatformFeeInvoice,
};
use crate::policy::BillingPeriod;

#[derive(Default)]
struct State {
    users: Vec<(Uuid, String)>,
    configs: Vec<PlatformFeeConfig>,
    invoices: Vec<PlatformFeeInvoice>,
    attempts: Vec<PlatformFeeAttempt>,
}

impl State {
    fn has_success(&self, invoice_id: Uuid) -> bool {
        self.attempts
            .iter()
            .any(|a| a.invoice_id == invoice_id && a.status == AttemptStatus::Success)
    }

    fn resolve_config(&self, user_type: &str, period_start: NaiveDate) -> Option<&PlatformFeeConfig> {
        self.configs
            .iter()
            .filter(|c| c.user_type == user_type && c.active && c.effective_from <= period_start)
            .max_by_key(|c| c.effective_from)
    }

    fn record(&self, invoice: &PlatformFeeInvoice) -> InvoiceRecord {
        InvoiceRecord {
            invoice: invoice.clone(),
            has_successful_attempt: self.has_success(invoice.id),
        }
    }
}

struct OutboxTarget {
    store: Arc<InMemoryOutboxStore>,
    exchange: String,
}

/// Fee repository backed by vectors behind one mutex, so each operation is
/// atomic like the conditional statements of the Postgres repository.
#[derive(Default)]
pub struct InMemoryFeeRepository {
    state: Mutex<State>,
    outbox: Option<OutboxTarget>,
}

impl InMemoryFeeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record transition events in `store` under the state lock. A rejected
    /// write leaves the state untouched.
    pub fn with_outbox(store: Arc<InMemoryOutboxStore>, exchange: impl Into<String>) -> Self {
        Self {
            state: Mutex::default(),
            outbox: Some(OutboxTarget {
                store,
                exchange: exchange.into(),
            }),
        }
    }

    pub fn add_user(&self, user_id: Uuid, user_type: &str) {
        self.with_state(|s| s.users.push((user_id, user_type.to_string())));
    }

    pub fn add_config(&self, user_type: &str, fee_amount: i64, currency: &str, effective_from: NaiveDate) {
        self.with_state(|s| {
            s.configs.push(PlatformFeeConfig {
                id: Uuid::new_v4(),
                user_type: user_type.to_string(),
                fee_amount,
                currency: currency.to_string(),
                effective_from,
                active: true,
            })
        });
    }

    /// Seed an invoice directly, bypassing generation
    pub fn insert_invoice(&self, invoice: PlatformFeeInvoice) {
        self.with_state(|s| s.invoices.push(invoice));
    }

    pub fn invoices(&self) -> Vec<PlatformFeeInvoice> {
        self.with_state(|s| s.invoices.clone())
    }

    pub fn attempts(&self) -> Vec<PlatformFeeAttempt> {
        self.with_state(|s| s.attempts.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn record_events(&self, events: &[PlatformFeeEvent], occurred_at: DateTime<Utc>) -> BillingResult<()> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };
        if events.is_empty() {
            return Ok(());
        }
        let messages = events
            .iter()
            .map(|event| event_payload(event, occurred_at).map(|payload| (event.routing_key(), payload)))
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .map_err(|e| BillingError::Internal(format!("Failed to encode platform fee event: {e}")))?;
        outbox.store.append_all(&outbox.exchange, &messages)?;
        Ok(())
    }

    /// Apply `mutate` when `apply` holds, recording `announce(updated)` first.
    fn update_invoice(
        &self,
        invoice_id: Uuid,
        apply: impl FnOnce(&State, &PlatformFeeInvoice) -> bool,
        mutate: impl FnOnce(&mut PlatformFeeInvoice),
        announce: impl FnOnce(&PlatformFeeInvoice) -> Option<PlatformFeeEvent>,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        self.with_state(|s| {
            let Some(idx) = s.invoices.iter().position(|i| i.id == invoice_id) else {
                return Ok(None);
            };
            if !apply(s, &s.invoices[idx]) {
                return Ok(None);
            }
            let mut updated = s.invoices[idx].clone();
            mutate(&mut updated);
            if let Some(event) = announce(&updated) {
                self.record_events(&[event], now)?;
            }
            s.invoices[idx] = updated.clone();
            Ok(Some(updated))
        })
    }
}

#[async_trait]
impl FeeRepository for InMemoryFeeRepository {
    fn writes_outbox(&self) -> bool {
        self.outbox.is_some()
    }

    async fn create_invoices_for_period(
        &self,
        period: &BillingPeriod,
    ) -> BillingResult<Vec<PlatformFeeInvoice>> {
        let now = Utc::now();
        self.with_state(|s| {
            let mut created = Vec::new();
            for (user_id, user_type) in &s.users {
                let exists = s
                    .invoices
                    .iter()
                    .any(|i| i.user_id == *user_id && i.period_start == period.period_start);
                if exists {
                    continue;
                }
                let Some(config) = s.resolve_config(user_type, period.period_start) else {
                    continue;
                };
                created.push(PlatformFeeInvoice {
                    id: Uuid::new_v4(),
                    user_id: *user_id,
                    user_type: user_type.clone(),
                    period_start: period.period_start,
                    period_end: period.period_end,
                    due_at: period.due_at,
                    grace_until: period.grace_until,
                    amount: config.fee_amount,
                    currency: config.currency.clone(),
                    status: InvoiceStatus::Pending,
                    paid_at: None,
                    last_attempt_at: None,
                    retry_count: 0,
                    failure_reason: None,
                    created_at: now,
                    updated_at: now,
                });
            }
            let events: Vec<PlatformFeeEvent> = created.iter().map(PlatformFeeEvent::due).collect();
            self.record_events(&events, now)?;
            s.invoices.extend(created.iter().cloned());
            Ok(created)
        })
    }

    async fn find_chargeable_invoices(
        &self,
        now: DateTime<Utc>,
        attempted_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> BillingResult<Vec<PlatformFeeInvoice>> {
        Ok(self.with_state(|s| {
            let mut found: Vec<PlatformFeeInvoice> = s
                .invoices
                .iter()
                .filter(|i| {
                    i.status.is_open()
                        && i.due_at <= now
                        && now <= i.grace_until
                        && i.last_attempt_at.map_or(true, |at| at < attempted_before)
                        && after.map_or(true, |key| (i.due_at, i.id) > key)
                        && !s.has_success(i.id)
                })
                .cloned()
                .collect();
            found.sort_by_key(|i| (i.due_at, i.id));
            found.truncate(limit.max(0) as usize);
            found
        }))
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<PlatformFeeInvoice>> {
        Ok(self.with_state(|s| s.invoices.iter().find(|i| i.id == invoice_id).cloned()))
    }

    async fn claim_invoice_attempt(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        self.update_invoice(
            invoice_id,
            |s, i| {
                i.status.is_open()
                    && i.last_attempt_at.map_or(true, |at| at < window_start)
                    && !s.has_success(i.id)
            },
            |i| {
                i.last_attempt_at = Some(now);
                i.retry_count += 1;
                i.updated_at = now;
            },
            |_| None,
            now,
        )
    }

    async fn insert_attempt(&self, attempt: &NewAttempt) -> BillingResult<PlatformFeeAttempt> {
        self.with_state(|s| {
            if attempt.status == AttemptStatus::Success && s.has_success(attempt.invoice_id) {
                return Err(BillingError::ConcurrentModification(format!(
                    "invoice {} already has a successful attempt",
                    attempt.invoice_id
                )));
            }
            if !s.invoices.iter().any(|i| i.id == attempt.invoice_id) {
                return Err(BillingError::InvoiceNotFound(attempt.invoice_id));
            }
            let row = PlatformFeeAttempt {
                id: Uuid::new_v4(),
                invoice_id: attempt.invoice_id,
                attempted_at: attempt.attempted_at,
                amount: attempt.amount,
                status: attempt.status,
                failure_reason: attempt.failure_reason.clone(),
                provider_reference: attempt.provider_reference.clone(),
            };
            s.attempts.push(row.clone());
            Ok(row)
        })
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
        provider_reference: &str,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        self.update_invoice(
            invoice_id,
            |_, i| {
                matches!(
                    i.status,
                    InvoiceStatus::Pending | InvoiceStatus::Failed | InvoiceStatus::Delinquent
                )
            },
            |i| {
                i.status = InvoiceStatus::Paid;
                i.paid_at = Some(paid_at);
                i.failure_reason = None;
                i.updated_at = paid_at;
            },
            |paid| Some(PlatformFeeEvent::paid(paid, paid_at, provider_reference)),
            paid_at,
        )
    }

    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        self.update_invoice(
            invoice_id,
            |_, i| i.status.is_open(),
            |i| {
                i.status = InvoiceStatus::Failed;
                i.failure_reason = Some(reason.to_string());
                i.updated_at = now;
            },
            |failed| Some(PlatformFeeEvent::failed(failed, reason)),
            now,
        )
    }

    async fn mark_delinquent(&self, now: DateTime<Utc>) -> BillingResult<Vec<PlatformFeeInvoice>> {
        self.with_state(|s| {
            let targets: Vec<usize> = s
                .invoices
                .iter()
                .enumerate()
                .filter(|(_, i)| i.status.is_open() && i.grace_until < now && !s.has_success(i.id))
                .map(|(idx, _)| idx)
                .collect();

            let marked: Vec<PlatformFeeInvoice> = targets
                .iter()
                .map(|&idx| PlatformFeeInvoice {
                    status: InvoiceStatus::Delinquent,
                    updated_at: now,
                    ..s.invoices[idx].clone()
                })
                .collect();
            let events: Vec<PlatformFeeEvent> = marked.iter().map(PlatformFeeEvent::delinquent).collect();
            self.record_events(&events, now)?;
            for (idx, invoice) in targets.into_iter().zip(&marked) {
                s.invoices[idx] = invoice.clone();
            }
            Ok(marked)
        })
    }

    async fn latest_invoice_for_user(&self, user_id: Uuid) -> BillingResult<Option<InvoiceRecord>> {
        Ok(self.list_invoices_for_user(user_id, 1).await?.into_iter().next())
    }

    async fn list_invoices_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        Ok(self.with_state(|s| {
            let mut invoices: Vec<&PlatformFeeInvoice> =
                s.invoices.iter().filter(|i| i.user_id == user_id).collect();
            invoices.sort_by(|a, b| b.period_start.cmp(&a.period_start));
            invoices
                .into_iter()
                .take(limit.max(0) as usize)
                .map(|i| s.record(i))
                .collect()
        }))
    }

    async fn list_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PlatformFeeAttempt>> {
        Ok(self.with_state(|s| {
            s.attempts
                .iter()
                .filter(|a| a.invoice_id == invoice_id)
                .cloned()
                .collect()
        }))
    }
}
