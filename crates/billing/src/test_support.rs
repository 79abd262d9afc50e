//! Fakes shared by the billing unit tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use transfa_shared::{EventPublisher, PublishError};
use uuid::Uuid;

use crate::models::{InvoiceStatus, PlatformFeeInvoice};
use crate::transaction::{DebitError, TransactionClient};

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// December 2023 invoice due 2024-01-01T00:05Z with a seven day grace
pub fn sample_invoice() -> PlatformFeeInvoice {
    let due_at = at(2024, 1, 1, 0, 5);
    PlatformFeeInvoice {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        user_type: "personal".to_string(),
        period_start: NaiveDate::from_ymd_opt(2023, 12, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
        due_at,
        grace_until: due_at + Duration::days(7),
        amount: 50_000,
        currency: "NGN".to_string(),
        status: InvoiceStatus::Pending,
        paid_at: None,
        last_attempt_at: None,
        retry_count: 0,
        failure_reason: None,
        created_at: due_at,
        updated_at: due_at,
    }
}

/// Records every published event; optionally fails every publish
#[derive(Default)]
pub struct RecordingPublisher {
    fail: bool,
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn bodies(&self, routing_key: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Connect("broker down".to_string()));
        }
        let json = serde_json::from_slice(body)?;
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), json));
        Ok(())
    }
}

/// Transaction client with scripted per-user outcomes; succeeds by default
#[derive(Default)]
pub struct FakeTransactionClient {
    declines: Mutex<HashMap<Uuid, String>>,
    debits: Mutex<Vec<(Uuid, i64, Uuid)>>,
    cancel_on_debit: Mutex<Option<CancellationToken>>,
}

impl FakeTransactionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline(&self, user_id: Uuid, reason: &str) {
        self.declines
            .lock()
            .unwrap()
            .insert(user_id, reason.to_string());
    }

    pub fn approve(&self, user_id: Uuid) {
        self.declines.lock().unwrap().remove(&user_id);
    }

    /// Fire `token` during the next debit, as a shutdown arriving mid-run would
    pub fn cancel_on_debit(&self, token: CancellationToken) {
        *self.cancel_on_debit.lock().unwrap() = Some(token);
    }

    /// `(user_id, amount, invoice_id)` for every debit call
    pub fn debits(&self) -> Vec<(Uuid, i64, Uuid)> {
        self.debits.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionClient for FakeTransactionClient {
    async fn debit_platform_fee(
        &self,
        user_id: Uuid,
        amount: i64,
        invoice_id: Uuid,
    ) -> Result<String, DebitError> {
        self.debits.lock().unwrap().push((user_id, amount, invoice_id));
        if let Some(token) = self.cancel_on_debit.lock().unwrap().take() {
            token.cancel();
        }
        if let Some(reason) = self.declines.lock().unwrap().get(&user_id) {
            return Err(DebitError::Declined(reason.clone()));
        }
        Ok(format!("txn_{}", invoice_id.simple()))
    }
}
