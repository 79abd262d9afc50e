//! Platform fee routes
//!
//! User routes read the caller's own standing. Internal routes let schedulers
//! and operators trigger each billing job on demand.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use transfa_billing::{
    ChargeOutcome, ChargeRunSummary, DelinquencySummary, GenerationSummary, InvoiceDetail,
    InvoiceView, PlatformFeeStatus,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct InvoiceListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceListResponse {
    pub invoices: Vec<InvoiceView>,
}

/// Caller's current platform fee status
pub async fn get_my_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PlatformFeeStatus>> {
    let status = state
        .billing
        .fees
        .get_status_by_user_id(auth_user.user_id)
        .await?;
    Ok(Json(status))
}

/// Caller's invoice history, newest first
pub async fn list_my_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvoiceListQuery>,
) -> ApiResult<Json<InvoiceListResponse>> {
    if matches!(query.limit, Some(limit) if limit <= 0) {
        return Err(ApiError::Validation("limit must be positive".to_string()));
    }

    let invoices = state
        .billing
        .fees
        .list_invoices_for_user(auth_user.user_id, query.limit)
        .await?;
    Ok(Json(InvoiceListResponse { invoices }))
}

pub async fn generate_invoices(
    State(state): State<AppState>,
) -> ApiResult<Json<GenerationSummary>> {
    let summary = state.billing.fees.generate_monthly_invoices().await?;
    Ok(Json(summary))
}

pub async fn run_charge_attempts(
    State(state): State<AppState>,
) -> ApiResult<Json<ChargeRunSummary>> {
    let summary = state.billing.fees.run_charge_attempts().await?;
    Ok(Json(summary))
}

pub async fn run_delinquency(
    State(state): State<AppState>,
) -> ApiResult<Json<DelinquencySummary>> {
    let summary = state.billing.fees.mark_delinquent().await?;
    Ok(Json(summary))
}

pub async fn charge_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<ChargeOutcome>> {
    tracing::info!(invoice_id = %invoice_id, "Manual platform fee charge requested");
    let outcome = state.billing.fees.charge_invoice(invoice_id).await?;
    Ok(Json(outcome))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<InvoiceDetail>> {
    let detail = state.billing.fees.get_invoice_detail(invoice_id).await?;
    Ok(Json(detail))
}

pub async fn get_user_status(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<PlatformFeeStatus>> {
    let status = state.billing.fees.get_status_by_user_id(user_id).await?;
    Ok(Json(status))
}
