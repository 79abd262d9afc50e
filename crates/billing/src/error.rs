//! Billing error types

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        // A second success row for one invoice trips uq_platform_fee_attempts_success
        if let Some(db) = e.as_database_error() {
            if db.is_unique_violation() {
                return BillingError::ConcurrentModification(db.message().to_string());
            }
        }
        BillingError::Database(e.to_string())
    }
}

impl From<transfa_shared::OutboxError> for BillingError {
    fn from(e: transfa_shared::OutboxError) -> Self {
        match e {
            transfa_shared::OutboxError::Database(e) => e.into(),
            other => BillingError::Database(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
