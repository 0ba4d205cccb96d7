//! Error types and handling for the Coves OAuth core
//!
//! Provides a unified error type that converts to appropriate HTTP responses.
//! Variants track the error taxonomy: InputValidation, NotFound, AlreadyUsed,
//! Discovery, Protocol, Crypto, Ssrf, Security, HandleVerification, Transient,
//! CircuitOpen.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("input validation: {0}")]
    InputValidation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already used: {0}")]
    AlreadyUsed(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("ssrf rejected: {0}")]
    Ssrf(String),

    #[error("security check failed: {0}")]
    Security(String),

    #[error("handle verification failed: {0}")]
    HandleVerification(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("circuit open for {provider}: retry after {retry_after_secs}s")]
    CircuitOpen {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable slug surfaced to clients; never leaks internal detail.
    fn error_type(&self) -> &'static str {
        match self {
            AppError::InputValidation(_) => "input_validation",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyUsed(_) => "already_used",
            AppError::Discovery(_) => "discovery_failed",
            AppError::Protocol(_) => "protocol_error",
            AppError::Crypto(_) => "crypto_error",
            AppError::Ssrf(_) => "ssrf_rejected",
            AppError::Security(_) => "security_error",
            AppError::HandleVerification(_) => "handle_verification_failed",
            AppError::Transient(_) => "transient_error",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::Config(_) => "internal_error",
            AppError::Database(_) => "transient_error",
            AppError::HttpClient(_) => "transient_error",
            AppError::Json(_) => "internal_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InputValidation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyUsed(_) => StatusCode::BAD_REQUEST,
            AppError::Discovery(_) => StatusCode::BAD_GATEWAY,
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Ssrf(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Security(_) => StatusCode::FORBIDDEN,
            AppError::HandleVerification(_) => StatusCode::UNAUTHORIZED,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,
            AppError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal detail stays in the log; the client only ever sees the slug
        // plus a message that is safe to echo (validation/protocol/security
        // variants carry client-safe text already).
        match &self {
            AppError::Database(e) => tracing::error!(error = %e, "database error"),
            AppError::HttpClient(e) => tracing::error!(error = %e, "http client error"),
            AppError::Json(e) => tracing::error!(error = %e, "json error"),
            AppError::Crypto(msg) => tracing::error!(%msg, "crypto error"),
            AppError::Internal(msg) => tracing::error!(%msg, "internal error"),
            AppError::Config(msg) => tracing::error!(%msg, "config error"),
            _ => {}
        }

        let message = match &self {
            AppError::Database(_) => "a transient storage error occurred".to_string(),
            AppError::HttpClient(_) => "failed to reach an upstream service".to_string(),
            AppError::Json(_) => "failed to process a response".to_string(),
            AppError::Crypto(_) => "a cryptographic operation failed".to_string(),
            AppError::Internal(_) => "an internal error occurred".to_string(),
            AppError::Config(_) => "server configuration error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.error_type(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;
