//! Platform fee domain events
//!
//! Every invoice state transition is announced on the events exchange. Events
//! are typed here and only become opaque JSON at the publisher boundary.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use transfa_shared::EventPublisher;
use uuid::Uuid;

use crate::models::PlatformFeeInvoice;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformFeeEvent {
    Due {
        invoice_id: Uuid,
        user_id: Uuid,
        amount: i64,
        currency: String,
        period_start: NaiveDate,
        period_end: NaiveDate,
        due_at: DateTime<Utc>,
        grace_until: DateTime<Utc>,
    },
    Paid {
        invoice_id: Uuid,
        user_id: Uuid,
        amount: i64,
        currency: String,
        paid_at: DateTime<Utc>,
        provider_reference: String,
    },
    Failed {
        invoice_id: Uuid,
        user_id: Uuid,
        amount: i64,
        currency: String,
        reason: String,
        retry_count: i32,
        grace_until: DateTime<Utc>,
    },
    Delinquent {
        invoice_id: Uuid,
        user_id: Uuid,
        amount: i64,
        currency: String,
        grace_until: DateTime<Utc>,
    },
}

impl PlatformFeeEvent {
    pub fn due(invoice: &PlatformFeeInvoice) -> Self {
        PlatformFeeEvent::Due {
            invoice_id: invoice.id,
            user_id: invoice.user_id,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            due_at: invoice.due_at,
            grace_until: invoice.grace_until,
        }
    }

    pub fn paid(invoice: &PlatformFeeInvoice, paid_at: DateTime<Utc>, reference: &str) -> Self {
        PlatformFeeEvent::Paid {
            invoice_id: invoice.id,
            user_id: invoice.user_id,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            paid_at,
            provider_reference: reference.to_string(),
        }
    }

    pub fn failed(invoice: &PlatformFeeInvoice, reason: &str) -> Self {
        PlatformFeeEvent::Failed {
            invoice_id: invoice.id,
            user_id: invoice.user_id,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            reason: reason.to_string(),
            retry_count: invoice.retry_count,
            grace_until: invoice.grace_until,
        }
    }

    pub fn delinquent(invoice: &PlatformFeeInvoice) -> Self {
        PlatformFeeEvent::Delinquent {
            invoice_id: invoice.id,
            user_id: invoice.user_id,
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            grace_until: invoice.grace_until,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlatformFeeEvent::Due { .. } => "due",
            PlatformFeeEvent::Paid { .. } => "paid",
            PlatformFeeEvent::Failed { .. } => "failed",
            PlatformFeeEvent::Delinquent { .. } => "delinquent",
        }
    }

    pub fn routing_key(&self) -> String {
        format!("platform_fee.{}", self.kind())
    }

    pub fn invoice_id(&self) -> Uuid {
        match self {
            PlatformFeeEvent::Due { invoice_id, .. }
            | PlatformFeeEvent::Paid { invoice_id, .. }
            | PlatformFeeEvent::Failed { invoice_id, .. }
            | PlatformFeeEvent::Delinquent { invoice_id, .. } => *invoice_id,
        }
    }

    /// Consumers dedupe on this key; delivery is at-least-once.
    ///
    /// Failed events are keyed per attempt since one invoice can fail several times.
    pub fn idempotency_key(&self) -> String {
        match self {
            PlatformFeeEvent::Failed {
                invoice_id,
                retry_count,
                ..
            } => format!("{}:failed:{}", invoice_id, retry_count),
            other => format!("{}:{}", other.invoice_id(), other.kind()),
        }
    }
}

#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    idempotency_key: String,
    occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a PlatformFeeEvent,
}

/// JSON body published for an event
pub fn encode_event(
    event: &PlatformFeeEvent,
    occurred_at: DateTime<Utc>,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EventEnvelope {
        idempotency_key: event.idempotency_key(),
        occurred_at,
        event,
    })
}

/// The envelope as a JSON value, the form stored in outbox rows
pub fn event_payload(
    event: &PlatformFeeEvent,
    occurred_at: DateTime<Utc>,
) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(EventEnvelope {
        idempotency_key: event.idempotency_key(),
        occurred_at,
        event,
    })
}

/// Publishes billing events without ever failing the billing operation
#[derive(Clone)]
pub struct BillingEventPublisher {
    publisher: Arc<dyn EventPublisher>,
    exchange: String,
}

impl BillingEventPublisher {
    pub fn new(publisher: Arc<dyn EventPublisher>, exchange: impl Into<String>) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Returns whether the publisher accepted the event
    pub async fn emit(&self, event: &PlatformFeeEvent) -> bool {
        let routing_key = event.routing_key();
        let body = match encode_event(event, Utc::now()) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    invoice_id = %event.invoice_id(),
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to encode platform fee event"
                );
                return false;
            }
        };

        match self
            .publisher
            .publish(&self.exchange, &routing_key, &body)
            .await
        {
            Ok(()) => {
                debug!(invoice_id = %event.invoice_id(), routing_key = %routing_key, "Platform fee event published");
                true
            }
            Err(e) => {
                warn!(
                    invoice_id = %event.invoice_id(),
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish platform fee event"
                );
                false
            }
        }
    }
}
