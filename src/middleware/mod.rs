//! Middleware: sealed-session extraction and per-session/per-IP rate limiting.

mod auth;
pub mod rate_limit;

pub use auth::{auth_middleware, optional_auth_middleware, SESSION_COOKIE_NAME};
