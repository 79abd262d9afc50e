//! Fixed-window rate limiting with pluggable storage
//!
//! The limiter itself holds no counters. Counting lives behind
//! [`RateLimitStore`]: [`InMemoryRateLimitStore`] for a single instance,
//! [`RedisRateLimitStore`] when several API replicas must share one budget.
//! Billing correctness never depends on this module; invoice and outbox work is
//! coordinated through database row claims.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result of a rate limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window resets (only set when rejected)
    pub retry_after_seconds: Option<u64>,
}

/// Counter storage for the limiter
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment the counter for `key` in window `window_index` and return the new
    /// count. Counters may be discarded once `ttl` has elapsed.
    async fn hit(&self, key: &str, window_index: i64, ttl: Duration)
        -> Result<u64, RateLimitError>;

    /// Drop counters for windows older than `current_window`
    async fn cleanup(&self, _current_window: i64) {}
}

/// Per-process counters
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, (i64, u64)>>,
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        window_index: i64,
        _ttl: Duration,
    ) -> Result<u64, RateLimitError> {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert((window_index, 0));
        if entry.0 != window_index {
            *entry = (window_index, 0);
        }
        entry.1 += 1;
        Ok(entry.1)
    }

    async fn cleanup(&self, current_window: i64) {
        let mut windows = self.windows.lock().await;
        windows.retain(|_, (window, _)| *window >= current_window);
    }
}

/// Counters shared through Redis (`INCR` + `EXPIRE` in one atomic pipeline)
#[derive(Clone)]
pub struct RedisRateLimitStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            prefix: "transfa:ratelimit".to_string(),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        window_index: i64,
        ttl: Duration,
    ) -> Result<u64, RateLimitError> {
        let redis_key = format!("{}:{}:{}", self.prefix, key, window_index);
        let mut conn = self.manager.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1u64)
            .expire(&redis_key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Fixed-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, window: Duration) -> Self {
        let window = if window.as_secs() == 0 {
            Duration::from_secs(1)
        } else {
            window
        };
        Self { store, window }
    }

    /// One-minute windows counted in process memory
    pub fn new_in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryRateLimitStore::default()),
            Duration::from_secs(60),
        )
    }

    fn current_window(&self) -> (i64, u64) {
        let window_secs = self.window.as_secs() as i64;
        let now = Utc::now().timestamp();
        let index = now.div_euclid(window_secs);
        let resets_in = (window_secs - now.rem_euclid(window_secs)) as u64;
        (index, resets_in)
    }

    /// Count one request for `key` against `limit` requests per window
    pub async fn check(&self, key: &str, limit: u64) -> Result<RateLimitDecision, RateLimitError> {
        let (window_index, resets_in) = self.current_window();
        let count = self
            .store
            .hit(key, window_index, self.window * 2)
            .await?;

        let allowed = count <= limit;
        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            retry_after_seconds: (!allowed).then_some(resets_in),
        })
    }

    pub async fn cleanup(&self) {
        let (window_index, _) = self.current_window();
        self.store.cleanup(window_index).await;
    }
}
