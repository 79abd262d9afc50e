//! Outbox dispatcher loop

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{retry_after, truncate_error, OutboxError, OutboxMessage, OutboxStats, OutboxStore};
use crate::publisher::{EventPublisher, PublishError};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Rows claimed per flush
    pub batch_size: i64,
    /// Sleep between polls when the previous flush did not fill a batch
    pub poll_interval: Duration,
    /// A `processing` row older than this is considered abandoned and reclaimed
    pub stale_after: Duration,
    /// Cap on the retry delay after a failed publish
    pub max_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(300),
            max_backoff: super::MAX_RETRY_BACKOFF,
        }
    }
}

impl DispatcherConfig {
    /// Read `OUTBOX_BATCH_SIZE`, `OUTBOX_POLL_INTERVAL_MS` and
    /// `OUTBOX_STALE_AFTER_SECS`, keeping defaults for anything unset or invalid
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            batch_size: read("OUTBOX_BATCH_SIZE")
                .filter(|n| *n > 0)
                .map(|n| n as i64)
                .unwrap_or(defaults.batch_size),
            poll_interval: read("OUTBOX_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            stale_after: read("OUTBOX_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            max_backoff: defaults.max_backoff,
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.stale_after.as_secs() as i64)
    }
}

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub claimed: usize,
    pub published: usize,
    pub rescheduled: usize,
}

/// Drains `event_outbox` to the broker.
///
/// Any number of dispatchers may run against the same table. Each flush claims a
/// disjoint batch, publishes it and acknowledges every row individually.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub async fn flush_once(&self) -> Result<FlushSummary, OutboxError> {
        self.flush_once_at(Utc::now()).await
    }

    /// Claim due and stale rows as of `now` and try to publish each of them
    pub async fn flush_once_at(&self, now: DateTime<Utc>) -> Result<FlushSummary, OutboxError> {
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.stale_before(now), now)
            .await?;

        let mut summary = FlushSummary {
            claimed: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(summary);
        }

        // Once the broker is unreachable, the rest of the batch is rescheduled
        // without another connect attempt per row.
        let mut broker_down: Option<String> = None;

        for message in batch {
            let outcome = match &broker_down {
                Some(reason) => Err(reason.clone()),
                None => match self.publish(&message).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if matches!(e, PublishError::Connect(_) | PublishError::Timeout(_)) {
                            broker_down = Some(e.to_string());
                        }
                        Err(e.to_string())
                    }
                },
            };

            match outcome {
                Ok(()) => {
                    if self.store.mark_published(message.id, now).await? {
                        summary.published += 1;
                    } else {
                        tracing::warn!(
                            outbox_id = message.id,
                            "Outbox row no longer processing after publish"
                        );
                    }
                }
                Err(error) => {
                    let delay = retry_after(message.attempts, self.config.max_backoff);
                    let next_attempt_at = now + chrono::Duration::seconds(delay.as_secs() as i64);
                    tracing::warn!(
                        outbox_id = message.id,
                        routing_key = %message.routing_key,
                        attempts = message.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %error,
                        "Outbox publish failed"
                    );
                    self.store
                        .reschedule(message.id, &truncate_error(&error), next_attempt_at)
                        .await?;
                    summary.rescheduled += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        let body = serde_json::to_vec(&message.payload)?;
        self.publisher
            .publish(&message.exchange, &message.routing_key, &body)
            .await
    }

    pub async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        self.store
            .stats(self.config.stale_before(Utc::now()))
            .await
    }

    /// Poll until `cancel` fires.
    ///
    /// A flush that filled a whole batch polls again immediately; otherwise the loop
    /// sleeps `poll_interval`. Cancellation is observed between flushes only, rows
    /// claimed by an interrupted flush are recovered by the stale reclaim.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            stale_after_secs = self.config.stale_after.as_secs(),
            "Outbox dispatcher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let full_batch = match self.flush_once().await {
                Ok(summary) => {
                    if summary.claimed > 0 {
                        tracing::info!(
                            claimed = summary.claimed,
                            published = summary.published,
                            rescheduled = summary.rescheduled,
                            "Outbox flush complete"
                        );
                    }
                    summary.claimed as i64 >= self.config.batch_size
                        && summary.rescheduled == 0
                }
                Err(e) => {
                    tracing::error!(error = %e, "Outbox flush failed");
                    false
                }
            };

            if full_batch {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }
}
