//! PostgreSQL-backed outbox store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use super::{OutboxError, OutboxMessage, OutboxStats, OutboxStore};

const MESSAGE_COLUMNS: &str = r#"
    o.id, o.exchange, o.routing_key, o.payload, o.status, o.attempts,
    o.next_attempt_at, o.processing_started_at, o.published_at, o.last_error, o.created_at
"#;

/// Outbox store over the `event_outbox` table
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending row using any executor.
    ///
    /// Pass a transaction (`&mut *tx`) to commit the event together with the
    /// domain write it announces.
    pub async fn enqueue_with<'e, E>(
        executor: E,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, OutboxError>
    where
        E: PgExecutor<'e>,
    {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_outbox (exchange, routing_key, payload, status, next_attempt_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            RETURNING id
            "#,
        )
        .bind(exchange)
        .bind(routing_key)
        .bind(payload)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, OutboxError> {
        Self::enqueue_with(&self.pool, exchange, routing_key, payload).await
    }

    async fn claim_batch(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        // Selection and the flip to 'processing' are one statement; SKIP LOCKED lets
        // concurrent dispatchers take disjoint batches without waiting on each other.
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id
                FROM event_outbox
                WHERE (status = 'pending' AND next_attempt_at <= $1)
                   OR (status = 'processing' AND processing_started_at < $2)
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE event_outbox o
            SET status = 'processing',
                attempts = o.attempts + 1,
                processing_started_at = $1
            FROM due
            WHERE o.id = due.id
            RETURNING {MESSAGE_COLUMNS}
            "#
        );

        let mut rows: Vec<OutboxMessage> = sqlx::query_as(&sql)
            .bind(now)
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the CTE ordering
        rows.sort_by_key(|m| m.id);
        Ok(rows)
    }

    async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published',
                published_at = $2,
                processing_started_at = NULL,
                last_error = NULL
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'pending',
                next_attempt_at = GREATEST(next_attempt_at, $3),
                processing_started_at = NULL,
                last_error = $2
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<OutboxStats, OutboxError> {
        let stats: OutboxStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'published') AS published,
                COUNT(*) FILTER (
                    WHERE status = 'processing' AND processing_started_at < $1
                ) AS stale_processing,
                MIN(created_at) FILTER (WHERE status = 'pending') AS oldest_pending_at
            FROM event_outbox
            "#,
        )
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }
}
