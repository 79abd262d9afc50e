//! In-memory outbox store for single-process runs and tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{OutboxError, OutboxMessage, OutboxStats, OutboxStatus, OutboxStore};

/// Outbox store backed by a `Vec`. The mutex makes each operation atomic, which
/// mirrors the row-claim semantics of the Postgres store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<OutboxMessage>>,
    unavailable: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row, in insertion order
    pub fn snapshot(&self) -> Vec<OutboxMessage> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Reject every write until cleared, like a database that refuses inserts
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Append `(routing_key, payload)` rows as one unit: all of them or none.
    ///
    /// Synchronous so callers holding their own lock can commit rows together
    /// with the state change they announce.
    pub fn append_all(
        &self,
        exchange: &str,
        messages: &[(String, serde_json::Value)],
    ) -> Result<Vec<i64>, OutboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxError::Unavailable);
        }
        let now = Utc::now();
        Ok(self.with_rows(|rows| {
            messages
                .iter()
                .map(|(routing_key, payload)| {
                    let id = rows.len() as i64 + 1;
                    rows.push(OutboxMessage {
                        id,
                        exchange: exchange.to_string(),
                        routing_key: routing_key.clone(),
                        payload: payload.clone(),
                        status: OutboxStatus::Pending,
                        attempts: 0,
                        next_attempt_at: now,
                        processing_started_at: None,
                        published_at: None,
                        last_error: None,
                        created_at: now,
                    });
                    id
                })
                .collect()
        }))
    }

    fn with_rows<T>(&self, f: impl FnOnce(&mut Vec<OutboxMessage>) -> T) -> T {
        let mut guard = match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, OutboxError> {
        let ids = self.append_all(exchange, &[(routing_key.to_string(), payload.clone())])?;
        ids.first().copied().ok_or(OutboxError::Unavailable)
    }

    async fn claim_batch(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        Ok(self.with_rows(|rows| {
            let mut claimed = Vec::new();
            for row in rows.iter_mut() {
                if claimed.len() as i64 >= limit {
                    break;
                }
                let due = row.status == OutboxStatus::Pending && row.next_attempt_at <= now;
                let stale = row.status == OutboxStatus::Processing
                    && row.processing_started_at.is_some_and(|t| t < stale_before);
                if due || stale {
                    row.status = OutboxStatus::Processing;
                    row.attempts += 1;
                    row.processing_started_at = Some(now);
                    claimed.push(row.clone());
                }
            }
            claimed
        }))
    }

    async fn mark_published(&self, id: i64, now: DateTime<Utc>) -> Result<bool, OutboxError> {
        Ok(self.with_rows(|rows| {
            match rows
                .iter_mut()
                .find(|r| r.id == id && r.status == OutboxStatus::Processing)
            {
                Some(row) => {
                    row.status = OutboxStatus::Published;
                    row.published_at = Some(now);
                    row.processing_started_at = None;
                    row.last_error = None;
                    true
                }
                None => false,
            }
        }))
    }

    async fn reschedule(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        Ok(self.with_rows(|rows| {
            match rows
                .iter_mut()
                .find(|r| r.id == id && r.status == OutboxStatus::Processing)
            {
                Some(row) => {
                    row.status = OutboxStatus::Pending;
                    row.next_attempt_at = row.next_attempt_at.max(next_attempt_at);
                    row.processing_started_at = None;
                    row.last_error = Some(error.to_string());
                    true
                }
                None => false,
            }
        }))
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<OutboxStats, OutboxError> {
        Ok(self.with_rows(|rows| {
            let count = |status: OutboxStatus| rows.iter().filter(|r| r.status == status).count();
            OutboxStats {
                pending: count(OutboxStatus::Pending) as i64,
                processing: count(OutboxStatus::Processing) as i64,
                published: count(OutboxStatus::Published) as i64,
                stale_processing: rows
                    .iter()
                    .filter(|r| {
                        r.status == OutboxStatus::Processing
                            && r.processing_started_at.is_some_and(|t| t < stale_before)
                    })
                    .count() as i64,
                oldest_pending_at: rows
                    .iter()
                    .filter(|r| r.status == OutboxStatus::Pending)
                    .map(|r| r.created_at)
                    .min(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_store_writes_nothing() {
        let store = InMemoryOutboxStore::new();
        let messages = vec![
            ("platform_fee.due".to_string(), serde_json::json!({"n": 1})),
            ("platform_fee.due".to_string(), serde_json::json!({"n": 2})),
        ];

        store.set_unavailable(true);
        assert!(matches!(
            store.append_all("transfa.events", &messages),
            Err(OutboxError::Unavailable)
        ));
        assert!(store
            .enqueue("transfa.events", "platform_fee.due", &serde_json::json!({}))
            .await
            .is_err());
        assert!(store.snapshot().is_empty());

        store.set_unavailable(false);
        assert_eq!(store.append_all("transfa.events", &messages).unwrap(), vec![1, 2]);
        assert_eq!(store.snapshot()[1].payload["n"], 2);
    }
}
