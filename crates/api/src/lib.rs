// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Transfa Billing API Library
//!
//! HTTP surface for platform fee status, invoice history and the internal
//! billing job triggers.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
