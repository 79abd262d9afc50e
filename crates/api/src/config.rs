//! API server configuration

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Shared secret for server-to-server calls (`X-Internal-API-Key`)
    pub internal_api_key: String,
    /// HS256 secret for end-user bearer tokens
    pub jwt_secret: String,
    /// Required `aud` claim, when set
    pub jwt_audience: Option<String>,
    /// Redis for rate limiting across replicas; in-memory when unset
    pub redis_url: Option<String>,
    /// Requests per minute per caller on user routes
    pub rate_limit_per_minute: u64,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            internal_api_key: required("INTERNAL_API_KEY")?,
            jwt_secret: required("JWT_SECRET")?,
            jwt_audience: optional("JWT_AUDIENCE"),
            redis_url: optional("REDIS_URL"),
            rate_limit_per_minute: match std::env::var("RATE_LIMIT_PER_MINUTE") {
                Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "RATE_LIMIT_PER_MINUTE",
                    value,
                })?,
                Err(_) => 60,
            },
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
