//! Event publishing to the message broker
//!
//! Events leave the system through an [`EventPublisher`]. The production
//! implementation speaks AMQP 0-9-1 to a durable topic exchange; when the broker
//! cannot be reached at startup callers may fall back to [`NoopPublisher`] so
//! fire-and-forget announcements never block billing work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

/// Exchange used for every Transfa domain event unless configured otherwise
pub const DEFAULT_EVENTS_EXCHANGE: &str = "transfa.events";

/// Default bound on a single connect + publish + confirm round trip
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// AMQP persistent delivery mode
const PERSISTENT: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Broker rejected message on {exchange}/{routing_key}")]
    Nacked {
        exchange: String,
        routing_key: String,
    },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Event serialization failed: {0}")]
    Serialization(String),

    #[error("Outbox enqueue failed: {0}")]
    Enqueue(String),
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::Serialization(e.to_string())
    }
}

/// Publishes an opaque JSON body to `(exchange, routing_key)`
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError>;
}

/// Publisher used when no broker is available. Every publish succeeds and is dropped.
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        tracing::debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            body_len = body.len(),
            "Broker unavailable - dropping event"
        );
        Ok(())
    }
}

struct AmqpSession {
    // Dropping the connection closes the channel, so it lives alongside it
    _connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

/// AMQP publisher with lazy connect and reconnect-on-error.
///
/// The connection and channel are created on the first publish. Any publish error
/// (including a timeout) discards the cached channel so the next call reconnects
/// instead of retrying on a broken channel forever.
pub struct AmqpPublisher {
    url: String,
    timeout: Duration,
    session: Mutex<Option<AmqpSession>>,
}

impl AmqpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            session: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a publisher for direct (best-effort) announcements.
    ///
    /// Returns a [`NoopPublisher`] when no URL is configured or the broker does not
    /// answer an eager connect.
    pub async fn connect_or_noop(url: Option<&str>) -> Arc<dyn EventPublisher> {
        let Some(url) = url.filter(|u| !u.is_empty()) else {
            tracing::warn!("AMQP_URL not configured - events will not be published");
            return Arc::new(NoopPublisher);
        };

        let publisher = AmqpPublisher::new(url);
        match publisher.ensure_connected().await {
            Ok(()) => {
                tracing::info!("Connected to message broker");
                Arc::new(publisher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Message broker unreachable - using no-op publisher");
                Arc::new(NoopPublisher)
            }
        }
    }

    /// Establish the connection if there is no healthy cached channel
    pub async fn ensure_connected(&self) -> Result<(), PublishError> {
        let mut guard = self.session.lock().await;
        self.ensure_session(&mut guard).await
    }

    async fn ensure_session(&self, slot: &mut Option<AmqpSession>) -> Result<(), PublishError> {
        let healthy = slot
            .as_ref()
            .is_some_and(|s| s.channel.status().connected());
        if !healthy {
            *slot = None;
            let session = tokio::time::timeout(self.timeout, self.connect())
                .await
                .map_err(|_| PublishError::Timeout(self.timeout))??;
            *slot = Some(session);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<AmqpSession, PublishError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))?;

        tracing::debug!(channel_id = channel.id(), "Opened broker channel");

        Ok(AmqpSession {
            _connection: connection,
            channel,
            declared: HashSet::new(),
        })
    }

    async fn publish_on(
        session: &mut AmqpSession,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        if !session.declared.contains(exchange) {
            session
                .channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PublishError::Channel(e.to_string()))?;
            session.declared.insert(exchange.to_string());
        }

        let confirmation = session
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))?
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let mut guard = self.session.lock().await;

        if let Err(e) = self.ensure_session(&mut guard).await {
            *guard = None;
            return Err(e);
        }
        let Some(session) = guard.as_mut() else {
            return Err(PublishError::Channel("no broker channel".to_string()));
        };

        let result = tokio::time::timeout(
            self.timeout,
            Self::publish_on(session, exchange, routing_key, body),
        )
        .await
        .unwrap_or(Err(PublishError::Timeout(self.timeout)));

        if let Err(e) = &result {
            tracing::warn!(
                exchange = %exchange,
                routing_key = %routing_key,
                error = %e,
                "Publish failed - dropping broker channel"
            );
            *guard = None;
        }

        result
    }
}
