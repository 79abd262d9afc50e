use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use transfa_shared::PgOutboxStore;
use uuid::Uuid;

use super::FeeRepository;
use crate::error::{BillingError, BillingResult};
use crate::events::{event_payload, PlatformFeeEvent};
use crate::models::{InvoiceRecord, NewAttempt, PlatformFeeAttempt, PlatformFeeInvoice};
use crate::policy::BillingPeriod;

const INVOICE_COLUMNS: &str = r#"
    i.id, i.user_id, i.user_type, i.period_start, i.period_end, i.due_at, i.grace_until,
    i.amount, i.currency, i.status, i.paid_at, i.last_attempt_at, i.retry_count,
    i.failure_reason, i.created_at, i.updated_at
"#;

const HAS_SUCCESS: &str = r#"
    EXISTS (
        SELECT 1 FROM platform_fee_attempts a
        WHERE a.invoice_id = i.id AND a.status = 'success'
    )
"#;

/// Fee repository over the `platform_fee_*` tables
#[derive(Clone)]
pub struct PgFeeRepository {
    pool: PgPool,
    outbox_exchange: Option<String>,
}

impl PgFeeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            outbox_exchange: None,
        }
    }

    /// Transitions insert their `event_outbox` rows in the same transaction
    pub fn with_outbox(pool: PgPool, exchange: impl Into<String>) -> Self {
        Self {
            pool,
            outbox_exchange: Some(exchange.into()),
        }
    }

    async fn enqueue_events(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[PlatformFeeEvent],
        occurred_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let Some(exchange) = &self.outbox_exchange else {
            return Ok(());
        };
        for event in events {
            let payload = event_payload(event, occurred_at).map_err(|e| {
                BillingError::Internal(format!("Failed to encode platform fee event: {e}"))
            })?;
            PgOutboxStore::enqueue_with(&mut **tx, exchange, &event.routing_key(), &payload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FeeRepository for PgFeeRepository {
    fn writes_outbox(&self) -> bool {
        self.outbox_exchange.is_some()
    }

    async fn create_invoices_for_period(
        &self,
        period: &BillingPeriod,
    ) -> BillingResult<Vec<PlatformFeeInvoice>> {
        // Latest active config at or before the period start, per user type.
        // Users without one produce no row.
        let sql = format!(
            r#"
            INSERT INTO platform_fee_invoices AS i (
                user_id, user_type, period_start, period_end, due_at, grace_until,
                amount, currency, status
            )
            SELECT u.id, u.user_type, $1, $2, $3, $4, c.fee_amount, c.currency, 'pending'
            FROM users u
            JOIN LATERAL (
                SELECT fee_amount, currency
                FROM platform_fee_config
                WHERE user_type = u.user_type
                  AND active
                  AND effective_from <= $1
                ORDER BY effective_from DESC
                LIMIT 1
            ) c ON TRUE
            ON CONFLICT (user_id, period_start) DO NOTHING
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let invoices = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(period.period_start)
            .bind(period.period_end)
            .bind(period.due_at)
            .bind(period.grace_until)
            .fetch_all(&mut *tx)
            .await?;

        let events: Vec<PlatformFeeEvent> = invoices.iter().map(PlatformFeeEvent::due).collect();
        self.enqueue_events(&mut tx, &events, Utc::now()).await?;
        tx.commit().await?;

        Ok(invoices)
    }

    async fn find_chargeable_invoices(
        &self,
        now: DateTime<Utc>,
        attempted_before: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> BillingResult<Vec<PlatformFeeInvoice>> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM platform_fee_invoices i
            WHERE i.status IN ('pending', 'failed')
              AND i.due_at <= $1
              AND i.grace_until >= $1
              AND (i.last_attempt_at IS NULL OR i.last_attempt_at < $2)
              AND ($3::timestamptz IS NULL OR (i.due_at, i.id) > ($3, $4))
              AND NOT {HAS_SUCCESS}
            ORDER BY i.due_at, i.id
            LIMIT $5
            "#
        );

        let invoices = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(now)
            .bind(attempted_before)
            .bind(after.map(|(due_at, _)| due_at))
            .bind(after.map(|(_, id)| id))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(invoices)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<PlatformFeeInvoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM platform_fee_invoices i WHERE i.id = $1");
        let invoice = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(invoice)
    }

    async fn claim_invoice_attempt(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        // The row lock taken by UPDATE serializes concurrent claimers; the loser
        // re-evaluates the WHERE clause against the winner's last_attempt_at and
        // matches nothing.
        let sql = format!(
            r#"
            UPDATE platform_fee_invoices i
            SET last_attempt_at = $2,
                retry_count = i.retry_count + 1,
                updated_at = $2
            WHERE i.id = $1
              AND i.status IN ('pending', 'failed')
              AND (i.last_attempt_at IS NULL OR i.last_attempt_at < $3)
              AND NOT {HAS_SUCCESS}
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let invoice = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(invoice_id)
            .bind(now)
            .bind(window_start)
            .fetch_optional(&self.pool)
            .await?;

        Ok(invoice)
    }

    async fn insert_attempt(&self, attempt: &NewAttempt) -> BillingResult<PlatformFeeAttempt> {
        let row = sqlx::query_as::<_, PlatformFeeAttempt>(
            r#"
            INSERT INTO platform_fee_attempts (
                invoice_id, attempted_at, amount, status, failure_reason, provider_reference
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, invoice_id, attempted_at, amount, status, failure_reason, provider_reference
            "#,
        )
        .bind(attempt.invoice_id)
        .bind(attempt.attempted_at)
        .bind(attempt.amount)
        .bind(attempt.status.as_str())
        .bind(&attempt.failure_reason)
        .bind(&attempt.provider_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
        provider_reference: &str,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        let sql = format!(
            r#"
            UPDATE platform_fee_invoices i
            SET status = 'paid',
                paid_at = $2,
                failure_reason = NULL,
                updated_at = $2
            WHERE i.id = $1
              AND i.status IN ('pending', 'failed', 'delinquent')
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let invoice = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(invoice_id)
            .bind(paid_at)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(paid) = &invoice {
            let event = PlatformFeeEvent::paid(paid, paid_at, provider_reference);
            self.enqueue_events(&mut tx, &[event], paid_at).await?;
        }
        tx.commit().await?;

        Ok(invoice)
    }

    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PlatformFeeInvoice>> {
        let sql = format!(
            r#"
            UPDATE platform_fee_invoices i
            SET status = 'failed',
                failure_reason = $2,
                updated_at = $3
            WHERE i.id = $1
              AND i.status IN ('pending', 'failed')
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let invoice = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(invoice_id)
            .bind(reason)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(failed) = &invoice {
            self.enqueue_events(&mut tx, &[PlatformFeeEvent::failed(failed, reason)], now)
                .await?;
        }
        tx.commit().await?;

        Ok(invoice)
    }

    async fn mark_delinquent(&self, now: DateTime<Utc>) -> BillingResult<Vec<PlatformFeeInvoice>> {
        let sql = format!(
            r#"
            UPDATE platform_fee_invoices i
            SET status = 'delinquent',
                updated_at = $1
            WHERE i.status IN ('pending', 'failed')
              AND i.grace_until < $1
              AND NOT {HAS_SUCCESS}
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let invoices = sqlx::query_as::<_, PlatformFeeInvoice>(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        let events: Vec<PlatformFeeEvent> =
            invoices.iter().map(PlatformFeeEvent::delinquent).collect();
        self.enqueue_events(&mut tx, &events, now).await?;
        tx.commit().await?;

        Ok(invoices)
    }

    async fn latest_invoice_for_user(&self, user_id: Uuid) -> BillingResult<Option<InvoiceRecord>> {
        Ok(self.list_invoices_for_user(user_id, 1).await?.into_iter().next())
    }

    async fn list_invoices_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}, {HAS_SUCCESS} AS has_successful_attempt
            FROM platform_fee_invoices i
            WHERE i.user_id = $1
            ORDER BY i.period_start DESC
            LIMIT $2
            "#
        );

        let records = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<PlatformFeeAttempt>> {
        let attempts = sqlx::query_as::<_, PlatformFeeAttempt>(
            r#"
            SELECT id, invoice_id, attempted_at, amount, status, failure_reason, provider_reference
            FROM platform_fee_attempts
            WHERE invoice_id = $1
            ORDER BY attempted_at, id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }
}
