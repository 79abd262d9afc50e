//! Worker configuration

use std::time::Duration;

use thiserror::Error;

/// Daily; generation is idempotent so repeated runs only fill gaps
pub const DEFAULT_GENERATE_SCHEDULE: &str = "0 15 0 * * *";
/// Hourly; the attempt window lets each invoice through once per business day
pub const DEFAULT_CHARGE_SCHEDULE: &str = "0 10 * * * *";
pub const DEFAULT_DELINQUENCY_SCHEDULE: &str = "0 40 * * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// When a job runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Six-field cron expression (seconds first), UTC
    Cron(String),
    /// Fixed delay between the end of one run and the start of the next
    Every(Duration),
}

impl Cadence {
    /// `"every 300s"`, `"every 5m"` or a cron expression
    pub fn parse(name: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let invalid = || ConfigError::Invalid {
            name,
            value: raw.to_string(),
        };

        if let Some(rest) = raw.strip_prefix("every ") {
            let rest = rest.trim();
            let unit_at = rest.char_indices().last().map(|(i, _)| i).unwrap_or(0);
            let (digits, unit) = rest.split_at(unit_at);
            let n: u64 = digits.parse().map_err(|_| invalid())?;
            let secs = match unit {
                "s" => n,
                "m" => n * 60,
                "h" => n * 3600,
                _ => return Err(invalid()),
            };
            if secs == 0 {
                return Err(invalid());
            }
            return Ok(Cadence::Every(Duration::from_secs(secs)));
        }

        if raw.split_whitespace().count() != 6 {
            return Err(invalid());
        }
        Ok(Cadence::Cron(raw.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub generate: Cadence,
    pub charge: Cadence,
    pub delinquency: Cadence,
    /// Drain `event_outbox` to the broker from this process
    pub dispatcher_enabled: bool,
    pub amqp_url: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            generate: cadence("PLATFORM_FEE_GENERATE_SCHEDULE", DEFAULT_GENERATE_SCHEDULE)?,
            charge: cadence("PLATFORM_FEE_CHARGE_SCHEDULE", DEFAULT_CHARGE_SCHEDULE)?,
            delinquency: cadence(
                "PLATFORM_FEE_DELINQUENCY_SCHEDULE",
                DEFAULT_DELINQUENCY_SCHEDULE,
            )?,
            dispatcher_enabled: std::env::var("OUTBOX_DISPATCHER_ENABLED")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
            amqp_url: std::env::var("AMQP_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

fn cadence(name: &'static str, default: &str) -> Result<Cadence, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => Cadence::parse(name, &raw),
        _ => Cadence::parse(name, default),
    }
}
