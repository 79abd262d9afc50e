//! Platform fee data model
//!
//! Rows of `platform_fee_invoices`, `platform_fee_attempts` and
//! `platform_fee_config`, plus the derived status view served to clients.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingError;

/// Invoice lifecycle state
///
/// `pending <-> failed` while inside the attempt windows, then one of the
/// terminal states. `waived` is only ever set by operators outside this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
    Delinquent,
    Waived,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Delinquent => "delinquent",
            InvoiceStatus::Waived => "waived",
        }
    }

    /// Still collectible: eligible for claims and delinquency marking
    pub fn is_open(&self) -> bool {
        matches!(self, InvoiceStatus::Pending | InvoiceStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for InvoiceStatus {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "failed" => Ok(InvoiceStatus::Failed),
            "delinquent" => Ok(InvoiceStatus::Delinquent),
            "waived" => Ok(InvoiceStatus::Waived),
            _ => Err(BillingError::Internal(format!(
                "unknown invoice status '{}'",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for AttemptStatus {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            _ => Err(BillingError::Internal(format!(
                "unknown attempt status '{}'",
                value
            ))),
        }
    }
}

/// One user's platform fee for one billing period
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlatformFeeInvoice {
    pub id: Uuid,
    pub user_id: Uuid,
    /// User type at generation time; later type changes do not reprice the invoice
    pub user_type: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_at: DateTime<Utc>,
    pub grace_until: DateTime<Utc>,
    /// Minor currency units (kobo)
    pub amount: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Invoice row joined with whether a successful attempt exists for it
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvoiceRecord {
    #[sqlx(flatten)]
    pub invoice: PlatformFeeInvoice,
    pub has_successful_attempt: bool,
}

/// Append-only audit row for a single debit attempt
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlatformFeeAttempt {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub amount: i64,
    #[sqlx(try_from = "String")]
    pub status: AttemptStatus,
    pub failure_reason: Option<String>,
    pub provider_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub invoice_id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub amount: i64,
    pub status: AttemptStatus,
    pub failure_reason: Option<String>,
    pub provider_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlatformFeeConfig {
    pub id: Uuid,
    pub user_type: String,
    pub fee_amount: i64,
    pub currency: String,
    pub effective_from: NaiveDate,
    pub active: bool,
}

/// Invoice as presented to clients, with the self-healed status applied
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceView {
    pub id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: i64,
    pub currency: String,
    /// Status after accounting for successful attempt rows
    pub status: InvoiceStatus,
    /// Status as persisted, may lag behind `status`
    pub stored_status: InvoiceStatus,
    pub due_at: DateTime<Utc>,
    pub grace_until: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub is_within_grace: bool,
    pub is_delinquent: bool,
}

impl InvoiceView {
    /// Derive the client-facing view.
    ///
    /// A successful attempt row is proof of payment even when the invoice update
    /// that should have followed it never landed.
    pub fn derive(record: &InvoiceRecord, now: DateTime<Utc>) -> Self {
        let invoice = &record.invoice;
        let status = if record.has_successful_attempt
            && matches!(
                invoice.status,
                InvoiceStatus::Pending | InvoiceStatus::Failed | InvoiceStatus::Delinquent
            ) {
            InvoiceStatus::Paid
        } else {
            invoice.status
        };

        let is_within_grace = now <= invoice.grace_until;
        let is_delinquent = match status {
            InvoiceStatus::Paid | InvoiceStatus::Waived => false,
            InvoiceStatus::Delinquent => true,
            InvoiceStatus::Pending | InvoiceStatus::Failed => !is_within_grace,
        };

        Self {
            id: invoice.id,
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            status,
            stored_status: invoice.status,
            due_at: invoice.due_at,
            grace_until: invoice.grace_until,
            paid_at: invoice.paid_at,
            last_attempt_at: invoice.last_attempt_at,
            retry_count: invoice.retry_count,
            failure_reason: invoice.failure_reason.clone(),
            is_within_grace,
            is_delinquent,
        }
    }
}

/// A user's current platform fee standing
#[derive(Debug, Clone, Serialize)]
pub struct PlatformFeeStatus {
    pub user_id: Uuid,
    pub latest_invoice: Option<InvoiceView>,
    pub is_within_grace: bool,
    pub is_delinquent: bool,
}

impl PlatformFeeStatus {
    pub fn from_latest(user_id: Uuid, latest: Option<&InvoiceRecord>, now: DateTime<Utc>) -> Self {
        let latest_invoice = latest.map(|record| InvoiceView::derive(record, now));
        // No invoice means nothing is owed
        let (is_within_grace, is_delinquent) = latest_invoice
            .as_ref()
            .map(|v| (v.is_within_grace, v.is_delinquent))
            .unwrap_or((true, false));

        Self {
            user_id,
            latest_invoice,
            is_within_grace,
            is_delinquent,
        }
    }
}
