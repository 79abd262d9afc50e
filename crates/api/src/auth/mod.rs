//! Authentication for user and internal routes

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtValidator};
pub use middleware::{
    constant_time_eq, require_internal, require_user, AuthError, AuthMethod, AuthState, AuthUser,
    INTERNAL_API_KEY_HEADER, USER_ID_HEADER,
};
