//! Billing Invariants Module
//!
//! Runnable consistency checks over the platform fee and outbox tables. Run
//! them after incidents, replays or manual data fixes to confirm the system is
//! in a valid state.
//!
//! Every check is a single read-only SQL query; violations carry enough
//! context to find the offending rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected rows (invoice ids, user types, outbox ids)
    pub subject_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money moved or may move incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: DateTime<Utc>,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSuccessRow {
    invoice_id: Uuid,
    success_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SuccessUnpaidRow {
    invoice_id: Uuid,
    user_id: Uuid,
    status: String,
    provider_reference: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutSuccessRow {
    invoice_id: Uuid,
    user_id: Uuid,
    paid_at: Option<DateTime<Utc>>,
    amount: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OpenPastGraceRow {
    invoice_id: Uuid,
    status: String,
    grace_until: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnpricedUserTypeRow {
    user_type: String,
    user_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckOutboxRow {
    id: i64,
    routing_key: String,
    attempts: i32,
    processing_started_at: Option<DateTime<Utc>>,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        violations.extend(self.check_single_successful_attempt().await?);
        violations.extend(self.check_success_attempt_invoice_paid().await?);
        violations.extend(self.check_paid_has_success_attempt().await?);
        violations.extend(self.check_no_open_past_grace().await?);
        violations.extend(self.check_users_have_fee_config().await?);
        violations.extend(self.check_outbox_not_stuck().await?);

        let summary = InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        );

        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }

        Ok(summary)
    }

    /// Invariant 1: At most one successful attempt per invoice
    ///
    /// Two success rows mean the user was debited twice for one period.
    async fn check_single_successful_attempt(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSuccessRow> = sqlx::query_as(
            r#"
            SELECT invoice_id, COUNT(*) AS success_count
            FROM platform_fee_attempts
            WHERE status = 'success'
            GROUP BY invoice_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_successful_attempt".to_string(),
                subject_ids: vec![row.invoice_id.to_string()],
                description: format!(
                    "Invoice has {} successful attempts (expected at most 1)",
                    row.success_count
                ),
                context: serde_json::json!({ "success_count": row.success_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: A successful attempt implies a paid invoice
    ///
    /// Reads self-heal, but the stored status should catch up. Usually a crash
    /// between the attempt insert and the invoice update.
    async fn check_success_attempt_invoice_paid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SuccessUnpaidRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.user_id, i.status, a.provider_reference
            FROM platform_fee_invoices i
            JOIN platform_fee_attempts a ON a.invoice_id = i.id AND a.status = 'success'
            WHERE i.status NOT IN ('paid', 'waived')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "success_attempt_invoice_paid".to_string(),
                subject_ids: vec![row.invoice_id.to_string()],
                description: format!(
                    "Invoice has a successful attempt but is stored as '{}'",
                    row.status
                ),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "status": row.status,
                    "provider_reference": row.provider_reference,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Paid invoices have a successful attempt
    async fn check_paid_has_success_attempt(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutSuccessRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.user_id, i.paid_at, i.amount
            FROM platform_fee_invoices i
            WHERE i.status = 'paid'
              AND NOT EXISTS (
                  SELECT 1 FROM platform_fee_attempts a
                  WHERE a.invoice_id = i.id AND a.status = 'success'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_success_attempt".to_string(),
                subject_ids: vec![row.invoice_id.to_string()],
                description: "Invoice is paid with no successful attempt on record".to_string(),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "paid_at": row.paid_at,
                    "amount": row.amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: No open invoice outlives its grace period
    ///
    /// The delinquency job should have closed these; the job is probably not running.
    async fn check_no_open_past_grace(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenPastGraceRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.status, i.grace_until
            FROM platform_fee_invoices i
            WHERE i.status IN ('pending', 'failed')
              AND i.grace_until < NOW() - INTERVAL '1 day'
              AND NOT EXISTS (
                  SELECT 1 FROM platform_fee_attempts a
                  WHERE a.invoice_id = i.id AND a.status = 'success'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_open_past_grace".to_string(),
                subject_ids: vec![row.invoice_id.to_string()],
                description: format!(
                    "Invoice is still '{}' after grace ended at {}",
                    row.status, row.grace_until
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "grace_until": row.grace_until,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Every user type has an active fee config
    ///
    /// Invoice generation silently skips users it cannot price.
    async fn check_users_have_fee_config(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpricedUserTypeRow> = sqlx::query_as(
            r#"
            SELECT u.user_type, COUNT(*) AS user_count
            FROM users u
            WHERE NOT EXISTS (
                SELECT 1 FROM platform_fee_config c
                WHERE c.user_type = u.user_type
                  AND c.active
                  AND c.effective_from <= CURRENT_DATE
            )
            GROUP BY u.user_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "users_have_fee_config".to_string(),
                subject_ids: vec![row.user_type.clone()],
                description: format!(
                    "{} user(s) of type '{}' have no active platform fee config",
                    row.user_count, row.user_type
                ),
                context: serde_json::json!({
                    "user_type": row.user_type,
                    "user_count": row.user_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Outbox rows do not sit in processing
    ///
    /// Rows older than an hour in processing mean no dispatcher is reclaiming them.
    async fn check_outbox_not_stuck(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckOutboxRow> = sqlx::query_as(
            r#"
            SELECT id, routing_key, attempts, processing_started_at
            FROM event_outbox
            WHERE status = 'processing'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
            ORDER BY id
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "outbox_not_stuck".to_string(),
                subject_ids: vec![row.id.to_string()],
                description: format!(
                    "Outbox row for '{}' stuck in processing after {} attempt(s)",
                    row.routing_key, row.attempts
                ),
                context: serde_json::json!({
                    "routing_key": row.routing_key,
                    "attempts": row.attempts,
                    "processing_started_at": row.processing_started_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_successful_attempt" => self.check_single_successful_attempt().await,
            "success_attempt_invoice_paid" => self.check_success_attempt_invoice_paid().await,
            "paid_has_success_attempt" => self.check_paid_has_success_attempt().await,
            "no_open_past_grace" => self.check_no_open_past_grace().await,
            "users_have_fee_config" => self.check_users_have_fee_config().await,
            "outbox_not_stuck" => self.check_outbox_not_stuck().await,
            other => Err(BillingError::InvalidInput(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_successful_attempt",
            "success_attempt_invoice_paid",
            "paid_has_success_attempt",
            "no_open_past_grace",
            "users_have_fee_config",
            "outbox_not_stuck",
        ]
    }
}
