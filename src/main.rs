//! Coves OAuth Core
//!
//! A DID-bound OAuth 2.1 client for the AT Protocol federation: resolves
//! handles and DIDs, discovers per-PDS authorization servers, runs the
//! PAR/PKCE/DPoP authorization flow, verifies handles bidirectionally, and
//! seals the resulting session behind an opaque AES-256-GCM token so that
//! neither browser cookies nor mobile clients ever see a raw OAuth token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod authserver;
mod circuit_breaker;
mod config;
mod crypto;
mod dpop;
mod error;
mod handlers;
mod http_client;
mod identity;
mod metrics;
mod middleware;
mod mobile;
mod models;
mod oauth_client;
mod pkce;
mod routes;
mod sealer;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coves=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Coves OAuth core v{}", env!("CARGO_PKG_VERSION"));

    let app_config = config::AppConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    tracing::info!(
        "Configuration loaded. Server will listen on {}:{}",
        app_config.server.host,
        app_config.server.port
    );

    let state = Arc::new(config::AppState::new(app_config.clone()).await?);
    state.start_cleanup_task();
    metrics::register_metrics();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ready", get(routes::health::readiness_check))
        .route("/live", get(routes::health::liveness_check))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(routes::create_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from((
        app_config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or([127, 0, 0, 1].into()),
        app_config.server.port,
    ));

    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
