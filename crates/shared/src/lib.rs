// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Transfa Shared Infrastructure
//!
//! Building blocks used by both the API server and the background worker:
//!
//! - **Database**: pool construction and embedded migrations
//! - **Telemetry**: tracing subscriber setup
//! - **Publisher**: AMQP event publishing with a no-op fallback
//! - **Outbox**: durable event store and the dispatcher that drains it
//! - **Rate limiting**: pluggable fixed-window limiter (memory or Redis)

pub mod db;
pub mod outbox;
pub mod publisher;
pub mod rate_limit;
pub mod telemetry;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use outbox::{
    DispatcherConfig, FlushSummary, InMemoryOutboxStore, OutboxDispatcher, OutboxError,
    OutboxMessage, OutboxPublisher, OutboxStats, OutboxStatus, OutboxStore, PgOutboxStore,
};
pub use publisher::{
    AmqpPublisher, EventPublisher, NoopPublisher, PublishError, DEFAULT_EVENTS_EXCHANGE,
};
pub use rate_limit::{
    InMemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimiter, RedisRateLimitStore,
};
pub use telemetry::init_tracing;
