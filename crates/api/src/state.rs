//! Application state

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use transfa_billing::BillingService;
use transfa_shared::{
    DispatcherConfig, OutboxStore, PgOutboxStore, RateLimiter, RedisRateLimitStore,
};

use crate::{
    auth::{AuthState, JwtValidator},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub auth: AuthState,
    /// Outbox table, read for backlog stats
    pub outbox: Arc<dyn OutboxStore>,
    /// Processing rows older than this count as stale in stats
    pub outbox_stale_after: Duration,
    /// Per-caller throttle on user routes
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub async fn build(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone()).await?;
        tracing::info!("Platform fee billing service initialized");

        let rate_limiter = match &config.redis_url {
            Some(url) => match RedisRateLimitStore::connect(url).await {
                Ok(store) => {
                    tracing::info!("Rate limiting backed by Redis");
                    RateLimiter::new(Arc::new(store), Duration::from_secs(60))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable - rate limiting per instance");
                    RateLimiter::new_in_memory()
                }
            },
            None => RateLimiter::new_in_memory(),
        };

        Ok(Self::from_parts(
            config,
            billing,
            Arc::new(PgOutboxStore::new(pool)),
            DispatcherConfig::from_env().stale_after,
            rate_limiter,
        ))
    }

    pub fn from_parts(
        config: Config,
        billing: BillingService,
        outbox: Arc<dyn OutboxStore>,
        outbox_stale_after: Duration,
        rate_limiter: RateLimiter,
    ) -> Self {
        let auth = AuthState::new(
            JwtValidator::new(&config.jwt_secret, config.jwt_audience.as_deref()),
            &config.internal_api_key,
        );

        Self {
            config,
            billing: Arc::new(billing),
            auth,
            outbox,
            outbox_stale_after,
            rate_limiter,
        }
    }
}
