//! HTTP routes

mod internal;
mod platform_fees;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_internal, require_user, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/status", get(platform_fees::get_my_status))
        .route("/invoices", get(platform_fees::list_my_invoices))
        // Layers run bottom-up: authenticate first, then throttle per user
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_user,
        ));

    let internal_routes = Router::new()
        .route("/invoices/generate", post(platform_fees::generate_invoices))
        .route("/charge-attempts/run", post(platform_fees::run_charge_attempts))
        .route("/invoices/delinquent/run", post(platform_fees::run_delinquency))
        .route("/invoices/{id}", get(platform_fees::get_invoice))
        .route("/invoices/{id}/charge", post(platform_fees::charge_invoice))
        .route("/status/{user_id}", get(platform_fees::get_user_status))
        .route("/outbox/stats", get(internal::outbox_stats))
        .route("/invariants", get(internal::run_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_internal,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(user_routes)
        .nest("/internal", internal_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Fixed-window throttle keyed by the authenticated user
async fn enforce_rate_limit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let key = format!("user:{}", auth_user.user_id);
    let decision = state
        .rate_limiter
        .check(&key, state.config.rate_limit_per_minute)
        .await?;

    if !decision.allowed {
        tracing::warn!(user_id = %auth_user.user_id, limit = decision.limit, "Rate limit exceeded");
        return Err(ApiError::TooManyRequests {
            retry_after_seconds: decision.retry_after_seconds.unwrap_or(60),
        });
    }

    Ok(next.run(request).await)
}
