//! Router assembly: wires the OAuth handlers onto their HTTP paths and
//! layers on session extraction / rate limiting where the flow requires it.

pub mod health;

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};

use crate::config::AppState;
use crate::handlers::oauth;
use crate::middleware::{
    optional_auth_middleware,
    rate_limit::{ip_rate_limit, session_rate_limit},
};

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let auth_routes = Router::new()
        .route("/oauth/login", post(oauth::login))
        .route("/oauth/mobile/login", get(oauth::mobile_login))
        .route("/oauth/callback", get(oauth::callback))
        .layer(axum_middleware::from_fn_with_state(state.rate_limit.clone(), ip_rate_limit));

    let session_routes = Router::new()
        .route("/oauth/refresh", post(oauth::refresh))
        .route("/oauth/logout", post(oauth::logout))
        .layer(axum_middleware::from_fn_with_state(state.rate_limit.clone(), session_rate_limit))
        .layer(axum_middleware::from_fn_with_state(state.clone(), optional_auth_middleware));

    let discovery_routes = Router::new()
        .route("/oauth/client-metadata.json", get(oauth::client_metadata))
        .route("/oauth/jwks.json", get(oauth::jwks));

    Router::new()
        .merge(auth_routes)
        .merge(session_routes)
        .merge(discovery_routes)
}
