//! Billing configuration loaded from the environment

use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_TIMEZONE: &str = "Africa/Lagos";
pub const DEFAULT_DUE_OFFSET_MINUTES: i64 = 5;
pub const DEFAULT_GRACE_DAYS: i64 = 7;
pub const DEFAULT_ATTEMPT_DAY_OFFSETS: [i64; 5] = [0, 1, 3, 5, 7];
pub const DEFAULT_CHARGE_BATCH_SIZE: i64 = 500;
pub const DEFAULT_DEBIT_TIMEOUT: Duration = Duration::from_secs(15);

/// How billing events reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDelivery {
    /// Publish straight to the broker; failures are logged and dropped
    Direct,
    /// Enqueue into `event_outbox` for the dispatcher
    Outbox,
}

impl EventDelivery {
    fn parse(value: &str) -> BillingResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(EventDelivery::Direct),
            "outbox" => Ok(EventDelivery::Outbox),
            other => Err(BillingError::Config(format!(
                "BILLING_EVENT_DELIVERY must be 'direct' or 'outbox', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// IANA zone used for billing periods and attempt windows
    pub timezone: String,
    pub due_offset: ChronoDuration,
    pub grace_period: ChronoDuration,
    pub attempt_day_offsets: Vec<i64>,
    pub charge_batch_size: i64,
    pub events_exchange: String,
    pub event_delivery: EventDelivery,
    pub transaction_service_url: String,
    pub internal_api_key: String,
    pub debit_timeout: Duration,
    pub amqp_url: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let transaction_service_url = std::env::var("TRANSACTION_SERVICE_URL")
            .map_err(|_| BillingError::Config("TRANSACTION_SERVICE_URL not set".to_string()))?;
        let internal_api_key = std::env::var("INTERNAL_API_KEY")
            .map_err(|_| BillingError::Config("INTERNAL_API_KEY not set".to_string()))?;

        let due_offset_minutes = env_i64("PLATFORM_FEE_DUE_OFFSET_MINUTES", DEFAULT_DUE_OFFSET_MINUTES)?;
        let grace_days = env_i64("PLATFORM_FEE_GRACE_DAYS", DEFAULT_GRACE_DAYS)?;
        if due_offset_minutes < 0 || grace_days < 0 {
            return Err(BillingError::Config(
                "due offset and grace period must not be negative".to_string(),
            ));
        }

        let attempt_day_offsets = match std::env::var("PLATFORM_FEE_ATTEMPT_DAYS") {
            Ok(raw) => parse_day_offsets(&raw)?,
            Err(_) => DEFAULT_ATTEMPT_DAY_OFFSETS.to_vec(),
        };

        let charge_batch_size = env_i64("PLATFORM_FEE_CHARGE_BATCH_SIZE", DEFAULT_CHARGE_BATCH_SIZE)?;
        if charge_batch_size <= 0 {
            return Err(BillingError::Config(
                "PLATFORM_FEE_CHARGE_BATCH_SIZE must be positive".to_string(),
            ));
        }

        let debit_timeout = match std::env::var("TRANSACTION_SERVICE_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("invalid TRANSACTION_SERVICE_TIMEOUT_SECS '{}'", raw))
            })?),
            Err(_) => DEFAULT_DEBIT_TIMEOUT,
        };

        let event_delivery = match std::env::var("BILLING_EVENT_DELIVERY") {
            Ok(raw) => EventDelivery::parse(&raw)?,
            Err(_) => EventDelivery::Direct,
        };

        Ok(Self {
            timezone: std::env::var("BILLING_TIMEZONE")
                .unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string()),
            due_offset: ChronoDuration::minutes(due_offset_minutes),
            grace_period: ChronoDuration::days(grace_days),
            attempt_day_offsets,
            charge_batch_size,
            events_exchange: std::env::var("EVENTS_EXCHANGE")
                .unwrap_or_else(|_| transfa_shared::DEFAULT_EVENTS_EXCHANGE.to_string()),
            event_delivery,
            transaction_service_url: transaction_service_url.trim_end_matches('/').to_string(),
            internal_api_key,
            debit_timeout,
            amqp_url: std::env::var("AMQP_URL").ok().filter(|url| !url.trim().is_empty()),
        })
    }
}

fn env_i64(name: &str, default: i64) -> BillingResult<i64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid {} '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Parse a comma separated list of whole-day offsets, e.g. `0,1,3,5,7`
pub fn parse_day_offsets(raw: &str) -> BillingResult<Vec<i64>> {
    let mut offsets = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let offset: i64 = part
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid attempt day offset '{}'", part)))?;
        if offset < 0 {
            return Err(BillingError::Config(format!(
                "attempt day offset must not be negative: {}",
                offset
            )));
        }
        offsets.push(offset);
    }
    if offsets.is_empty() {
        return Err(BillingError::Config(
            "PLATFORM_FEE_ATTEMPT_DAYS must list at least one offset".to_string(),
        ));
    }
    offsets.sort_unstable();
    offsets.dedup();
    Ok(offsets)
}
