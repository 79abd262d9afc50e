//! Transactional outbox
//!
//! Domain writes record the events they announce in `event_outbox`; the
//! [`OutboxDispatcher`] drains that table to the broker.
//!
//! ## Guarantees
//!
//! - **At-least-once**: a crash between a broker publish and the local
//!   "mark published" write republishes the row. Consumers dedupe.
//! - **Multi-instance safe**: rows are claimed with `FOR UPDATE SKIP LOCKED` and
//!   flipped to `processing` in the same statement.
//! - **Crash recovery**: rows left in `processing` longer than the stale
//!   threshold are claimed again by the next poll.
//!
//! Row status only moves `pending -> processing -> {published | pending}`.

mod dispatcher;
mod memory;
mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::publisher::{EventPublisher, PublishError};

pub use dispatcher::{DispatcherConfig, FlushSummary, OutboxDispatcher};
pub use memory::InMemoryOutboxStore;
pub use store::PgOutboxStore;

/// Longest error string persisted in `last_error`
pub const MAX_ERROR_LEN: usize = 2000;

/// Upper bound on the retry delay after a failed publish
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown outbox status: {0}")]
    UnknownStatus(String),

    #[error("Outbox unavailable")]
    Unavailable,
}

/// Dispatch state of an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
        }
    }
}

impl TryFrom<String> for OutboxStatus {
    type Error = OutboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "published" => Ok(OutboxStatus::Published),
            _ => Err(OutboxError::UnknownStatus(value)),
        }
    }
}

/// A row of `event_outbox`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub exchange: String,
    pub routing_key: String,
    /// Opaque serialized event, only decoded at the transport edge
    pub payload: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Backlog snapshot for operators
#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
pub struct OutboxStats {
    pub pending: i64,
    pub processing: i64,
    pub published: i64,
    /// Rows in `processing` past the stale threshold (dispatcher likely died)
    pub stale_processing: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Persistence for outbox rows.
///
/// Every state change is a conditional write so that any number of dispatchers
/// may share one table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a pending row, due immediately
    async fn enqueue(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, OutboxError>;

    /// Atomically claim up to `limit` due or stale rows, moving them to `processing`
    /// and incrementing `attempts`
    async fn claim_batch(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// `processing -> published`. Returns false if the row was not in `processing`.
    async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<bool, OutboxError>;

    /// `processing -> pending` with a later `next_attempt_at`
    async fn reschedule(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError>;

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<OutboxStats, OutboxError>;
}

/// Delay before the next attempt: `min(2^attempts, 300)` seconds
pub fn retry_after(attempts: i32, max: Duration) -> Duration {
    let exp = attempts.clamp(0, 62) as u32;
    let secs = 1u64 << exp;
    Duration::from_secs(secs.min(max.as_secs()))
}

/// Truncate to at most `MAX_ERROR_LEN` bytes on a char boundary
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

/// [`EventPublisher`] that defers delivery by writing into the outbox.
///
/// The dispatcher later publishes the row to the broker, so announcements survive
/// broker outages and process restarts.
#[derive(Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventPublisher for OutboxPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let payload: serde_json::Value = serde_json::from_slice(body)?;
        let id = self
            .store
            .enqueue(exchange, routing_key, &payload)
            .await
            .map_err(|e| PublishError::Enqueue(e.to_string()))?;

        tracing::debug!(outbox_id = id, routing_key = %routing_key, "Event queued in outbox");
        Ok(())
    }
}
