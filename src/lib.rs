//! Coves OAuth Core
//!
//! This module exposes the DID-bound OAuth 2.1 subsystem for use in tests
//! and other contexts: identity resolution, auth-server discovery, PAR/PKCE/
//! DPoP token exchange, sealed session tokens, the mobile CSRF/redirect-binding
//! protocol, SSRF-safe outbound HTTP, and the persistent session/request store.

pub mod authserver;
pub mod circuit_breaker;
pub mod config;
pub mod crypto;
pub mod dpop;
pub mod error;
pub mod handlers;
pub mod http_client;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod mobile;
pub mod models;
pub mod oauth_client;
pub mod pkce;
pub mod routes;
pub mod sealer;
pub mod store;

pub use config::{AppConfig, AppState};
pub use error::{AppError, AppResult};
pub use models::*;
