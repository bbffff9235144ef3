//! Authentication for internal callers

pub mod middleware;

pub use middleware::{require_internal_token, AuthError, INTERNAL_TOKEN_HEADER};
