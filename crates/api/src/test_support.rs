//! Router harness for handler and middleware tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Datelike, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;
use transfa_billing::{
    BillingEventPublisher, BillingService, DebitError, FeeSchedule, InMemoryFeeRepository,
    InvariantChecker, InvoiceStatus, PlatformFeeInvoice, PlatformFeeService, TransactionClient,
};
use transfa_shared::{InMemoryOutboxStore, InMemoryRateLimitStore, NoopPublisher, RateLimiter};
use uuid::Uuid;

use crate::{auth::jwt::Claims, config::Config, routes::create_router, state::AppState};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const INTERNAL_KEY: &str = "test-internal-key";

pub fn test_config(rate_limit_per_minute: u64) -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: "postgres://localhost/transfa_test".to_string(),
        internal_api_key: INTERNAL_KEY.to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_audience: None,
        redis_url: None,
        rate_limit_per_minute,
        allowed_origins: vec![],
        run_migrations: false,
    }
}

/// Debit client that approves everything unless told otherwise
#[derive(Default)]
pub struct StubTransactions {
    declined: Mutex<Option<String>>,
    debits: Mutex<Vec<Uuid>>,
}

impl StubTransactions {
    pub fn decline_all(&self, reason: &str) {
        *self.declined.lock().unwrap() = Some(reason.to_string());
    }

    pub fn debit_count(&self) -> usize {
        self.debits.lock().unwrap().len()
    }
}

#[async_trait]
impl TransactionClient for StubTransactions {
    async fn debit_platform_fee(
        &self,
        _user_id: Uuid,
        _amount: i64,
        invoice_id: Uuid,
    ) -> Result<String, DebitError> {
        self.debits.lock().unwrap().push(invoice_id);
        match self.declined.lock().unwrap().clone() {
            Some(reason) => Err(DebitError::Declined(reason)),
            None => Ok(format!("txn_{}", invoice_id.simple())),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub repo: Arc<InMemoryFeeRepository>,
    pub transactions: Arc<StubTransactions>,
    pub outbox: Arc<InMemoryOutboxStore>,
}

impl TestApp {
    /// Must run inside a tokio runtime: the invariant checker holds a lazy pool
    pub fn new() -> Self {
        Self::with_rate_limit(1_000)
    }

    pub fn with_rate_limit(rate_limit_per_minute: u64) -> Self {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let repo = Arc::new(InMemoryFeeRepository::with_outbox(outbox.clone(), "transfa.events"));
        let transactions = Arc::new(StubTransactions::default());

        let fees = PlatformFeeService::new(
            repo.clone(),
            transactions.clone(),
            BillingEventPublisher::new(Arc::new(NoopPublisher), "transfa.events"),
            FeeSchedule::default(),
        );
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/transfa_test")
            .unwrap();
        let billing = BillingService {
            fees,
            invariants: InvariantChecker::new(pool),
        };

        // A long window keeps the counter from resetting mid-test
        let rate_limiter = RateLimiter::new(
            Arc::new(InMemoryRateLimitStore::default()),
            Duration::from_secs(3600),
        );

        let state = AppState::from_parts(
            test_config(rate_limit_per_minute),
            billing,
            outbox.clone(),
            Duration::from_secs(300),
            rate_limiter,
        );

        Self {
            router: create_router(state),
            repo,
            transactions,
            outbox,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}

pub fn token_for(user_id: Uuid, expires_in_secs: i64) -> String {
    token_with_secret(&user_id.to_string(), expires_in_secs, JWT_SECRET)
}

pub fn token_with_secret(sub: &str, expires_in_secs: i64, secret: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        exp: Utc::now().timestamp() + expires_in_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

pub fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

pub fn post(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("POST").uri(uri)
}

/// Pending invoice for `user_id` due at `due_at`, seven days of grace
pub fn open_invoice(user_id: Uuid, due_at: DateTime<Utc>) -> PlatformFeeInvoice {
    let period_end = (due_at - chrono::Duration::days(1)).date_naive();
    PlatformFeeInvoice {
        id: Uuid::new_v4(),
        user_id,
        user_type: "personal".to_string(),
        period_start: period_end.with_day0(0).unwrap_or(period_end),
        period_end,
        due_at,
        grace_until: due_at + chrono::Duration::days(7),
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
