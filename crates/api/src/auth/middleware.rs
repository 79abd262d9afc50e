//! Authentication middleware for Axum
//!
//! Two callers reach this service: wallet users with a bearer token, and other
//! Transfa services holding the internal API key.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::jwt::JwtValidator;

pub const INTERNAL_API_KEY_HEADER: &str = "X-Internal-API-Key";
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Authenticated caller of a user route
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    Jwt,
    /// Internal service acting on behalf of `X-User-ID`
    InternalKey,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt: JwtValidator,
    pub internal_api_key: Arc<str>,
}

impl AuthState {
    pub fn new(jwt: JwtValidator, internal_api_key: &str) -> Self {
        Self {
            jwt,
            internal_api_key: Arc::from(internal_api_key),
        }
    }

    fn internal_key_matches(&self, provided: &str) -> bool {
        constant_time_eq(&self.internal_api_key, provided)
    }
}

/// Compare secrets without leaking the mismatch position through timing
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Middleware for server-to-server routes
pub async fn require_internal(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match header_str(request.headers(), INTERNAL_API_KEY_HEADER) {
        Some(key) if auth_state.internal_key_matches(key) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %path, "require_internal: invalid internal API key");
            AuthError::InvalidApiKey.into_response()
        }
        None => {
            tracing::warn!(path = %path, "require_internal: missing internal API key");
            AuthError::MissingAuth.into_response()
        }
    }
}

/// Middleware for end-user routes. Inserts [`AuthUser`] into request extensions.
pub async fn require_user(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authenticate_user(&auth_state, request.headers()) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                auth_method = ?auth_user.auth_method,
                "require_user: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_user: authentication failed");
            err.into_response()
        }
    }
}

fn authenticate_user(auth_state: &AuthState, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    if let Some(token) = extract_bearer_token(headers) {
        let user_id = auth_state.jwt.validate(token).map_err(|e| {
            tracing::debug!(error = %e, "Bearer token rejected");
            AuthError::InvalidToken
        })?;
        return Ok(AuthUser {
            user_id,
            auth_method: AuthMethod::Jwt,
        });
    }

    if let Some(key) = header_str(headers, INTERNAL_API_KEY_HEADER) {
        if !auth_state.internal_key_matches(key) {
            return Err(AuthError::InvalidApiKey);
        }
        let user_id = header_str(headers, USER_ID_HEADER)
            .ok_or(AuthError::MissingUserId)
            .and_then(|raw| Uuid::parse_str(raw.trim()).map_err(|_| AuthError::MissingUserId))?;
        return Ok(AuthUser {
            user_id,
            auth_method: AuthMethod::InternalKey,
        });
    }

    Err(AuthError::MissingAuth)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Missing or invalid X-User-ID")]
    MissingUserId,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "Invalid API key"),
            AuthError::MissingUserId => (
                StatusCode::BAD_REQUEST,
                "X-User-ID header must be a valid user id",
            ),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
