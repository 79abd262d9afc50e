//! Operator visibility routes

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use transfa_billing::InvariantCheckSummary;
use transfa_shared::OutboxStats;

use crate::{error::ApiResult, state::AppState};

/// Outbox backlog: counts per status, stale processing rows, oldest pending row
pub async fn outbox_stats(State(state): State<AppState>) -> ApiResult<Json<OutboxStats>> {
    let stale_after = chrono::Duration::from_std(state.outbox_stale_after)
        .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let stats = state.outbox.stats(Utc::now() - stale_after).await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run one named check instead of all of them
    pub check: Option<String>,
}

pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = &state.billing.invariants;
    let summary = match query.check {
        Some(name) => {
            let violations = checker.run_check(&name).await?;
            InvariantCheckSummary::from_violations(Utc::now(), 1, violations)
        }
        None => checker.run_all_checks().await?,
    };
    Ok(Json(summary))
}
