//! Client for the transaction service that moves money out of user wallets

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DebitError {
    /// The bank refused the debit (insufficient funds, frozen account, ...)
    #[error("Debit declined: {0}")]
    Declined(String),

    /// Outcome unknown; the same invoice id is reused as idempotency key on retry
    #[error("Transaction service unreachable: {0}")]
    Transport(String),

    #[error("Invalid response from transaction service: {0}")]
    InvalidResponse(String),
}

/// Debits the platform fee from a user's primary account.
///
/// Implementations must treat `invoice_id` as the idempotency key so a retried
/// debit for the same invoice never moves money twice.
#[async_trait]
pub trait TransactionClient: Send + Sync {
    /// Returns the provider reference of the completed debit
    async fn debit_platform_fee(
        &self,
        user_id: Uuid,
        amount: i64,
        invoice_id: Uuid,
    ) -> Result<String, DebitError>;
}

#[derive(Debug, Serialize)]
struct DebitRequest {
    user_id: Uuid,
    amount: i64,
    invoice_id: Uuid,
    reason: &'static str,
}

#[derive(Debug, Deserialize)]
struct DebitResponse {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct DebitErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct HttpTransactionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransactionClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, DebitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DebitError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl TransactionClient for HttpTransactionClient {
    async fn debit_platform_fee(
        &self,
        user_id: Uuid,
        amount: i64,
        invoice_id: Uuid,
    ) -> Result<String, DebitError> {
        let url = format!("{}/internal/platform-fees/debit", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-Internal-API-Key", &self.api_key)
            .header("Idempotency-Key", invoice_id.to_string())
            .json(&DebitRequest {
                user_id,
                amount,
                invoice_id,
                reason: "platform_fee",
            })
            .send()
            .await
            .map_err(|e| DebitError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: DebitResponse = response
                .json()
                .await
                .map_err(|e| DebitError::InvalidResponse(e.to_string()))?;
            return Ok(body.transaction_id);
        }

        let text = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<DebitErrorBody>(&text)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        if status.is_server_error() {
            Err(DebitError::Transport(reason))
        } else {
            Err(DebitError::Declined(reason))
        }
    }
}
