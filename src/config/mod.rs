//! Configuration module.
//!
//! Handles loading configuration from environment variables and config
//! files, and assembling shared application state.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::authserver::AuthServerResolver;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::crypto::OAuthSigningKey;
use crate::http_client::SsrfSafeClient;
use crate::identity::{DevelopmentIdentityResolver, DirectoryIdentityResolver, IdentityResolver};
use crate::middleware::rate_limit::RateLimitState;
use crate::mobile::MobileRedirectAllowlist;
use crate::oauth_client::OAuthClientCore;
use crate::sealer::TokenSealer;
use crate::store::SessionStore;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub oauth: OAuthConfig,
    pub mobile: MobileConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub ssrf: SsrfConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL for this server, used as the audience/issuer in OAuth metadata.
    pub base_url: String,
    /// "production" or "development" — selects the Identity Resolver
    /// capability set and whether localhost auth-server metadata is allowed.
    #[serde(default = "default_profile")]
    pub profile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Client ID, typically the `client-metadata.json` URL.
    pub client_id: String,
    pub redirect_uri: String,
    /// ES256 private key, JWK JSON (optionally `base64:`-prefixed).
    pub private_jwk: Option<String>,
    pub private_key_pem_path: Option<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// 32-byte AES-256-GCM key for sealing session tokens, base64url-encoded.
    pub seal_key_base64: String,
    #[serde(default = "default_plc_directory")]
    pub plc_directory_url: String,
    #[serde(default = "default_bootstrap_resolver")]
    pub bootstrap_resolver_url: String,
    pub local_pds_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MobileConfig {
    #[serde(default)]
    pub allowed_redirect_uris: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsrfConfig {
    /// Dev-only escape hatch permitting private/loopback addresses. Must
    /// never be true in a production deployment.
    #[serde(default)]
    pub allow_private: bool,
}

impl Default for SsrfConfig {
    fn default() -> Self {
        Self { allow_private: false }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_profile() -> String {
    "production".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["atproto".to_string(), "transition:generic".to_string()]
}

fn default_plc_directory() -> String {
    "https://plc.directory".to_string()
}

fn default_bootstrap_resolver() -> String {
    "https://bsky.social".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_duration_secs() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from `config/default.toml`, `config/local.toml`,
    /// and `COVES__*`-prefixed environment variables (in that priority
    /// order), with a `.env` file loaded first via dotenvy.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("server.profile", default_profile())?
            .set_default("oauth.scopes", default_scopes())?
            .set_default("oauth.plc_directory_url", default_plc_directory())?
            .set_default("oauth.bootstrap_resolver_url", default_bootstrap_resolver())?
            .set_default("circuit_breaker.failure_threshold", default_failure_threshold())?
            .set_default("circuit_breaker.open_duration_secs", default_open_duration_secs())?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("COVES")
                    .separator("__")
                    .with_list_parse_key("COVES__OAUTH__SCOPES")
                    .with_list_parse_key("COVES__MOBILE__ALLOWED_REDIRECT_URIS")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.server.profile == "production"
    }
}

/// Shared application state, constructed once at startup and cloned cheaply
/// (every field is an `Arc` or already-cheap-to-clone handle) into each
/// request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: SessionStore,
    pub sealer: Arc<TokenSealer>,
    pub identity: Arc<dyn IdentityResolver>,
    pub authserver: Arc<AuthServerResolver>,
    pub oauth_client: Arc<OAuthClientCore>,
    pub mobile_allowlist: Arc<MobileRedirectAllowlist>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub dpop_nonce_cache: Arc<crate::dpop::DpopNonceCache>,
    pub rate_limit: Arc<RateLimitState>,
}

impl axum::extract::FromRef<Arc<AppState>> for Arc<RateLimitState> {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.rate_limit.clone()
    }
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self, anyhow::Error> {
        let ssrf_client = SsrfSafeClient::new(config.ssrf.allow_private)?;

        let store = SessionStore::connect(&config.database.url).await?;
        store.migrate().await?;

        let seal_key = crate::crypto::base64url_decode(&config.oauth.seal_key_base64)
            .map_err(|e| anyhow::anyhow!("invalid seal_key_base64: {e}"))?;
        let sealer = Arc::new(TokenSealer::new(&seal_key)?);

        let signing_key = match (&config.oauth.private_jwk, &config.oauth.private_key_pem_path) {
            (Some(jwk), _) => OAuthSigningKey::from_env_value(jwk, "coves-oauth-key-1")?,
            (None, Some(path)) => {
                let pem = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
                OAuthSigningKey::from_pkcs8_pem(&pem, "coves-oauth-key-1")?
            }
            (None, None) => {
                return Err(anyhow::anyhow!(
                    "no OAuth signing key configured: set oauth.private_jwk or oauth.private_key_pem_path"
                ))
            }
        };

        let directory_resolver = DirectoryIdentityResolver::new(
            ssrf_client.clone(),
            config.oauth.plc_directory_url.clone(),
            config.oauth.bootstrap_resolver_url.clone(),
        );

        let identity: Arc<dyn IdentityResolver> = if config.is_production() {
            Arc::new(directory_resolver)
        } else {
            let local_pds = config
                .oauth
                .local_pds_url
                .clone()
                .unwrap_or_else(|| "http://localhost:2583".to_string());
            Arc::new(DevelopmentIdentityResolver::new(
                directory_resolver,
                local_pds,
                ssrf_client.clone(),
            ))
        };

        let authserver = Arc::new(AuthServerResolver::new(ssrf_client.clone(), !config.is_production()));

        let oauth_client = Arc::new(OAuthClientCore::new(
            ssrf_client.clone(),
            signing_key,
            config.oauth.client_id.clone(),
            config.oauth.redirect_uri.clone(),
        ));

        let mobile_allowlist = Arc::new(MobileRedirectAllowlist::new(config.mobile.allowed_redirect_uris.clone()));

        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            open_duration: Duration::from_secs(config.circuit_breaker.open_duration_secs),
        }));

        let rate_limit = Arc::new(RateLimitState::new(
            crate::middleware::rate_limit::RateLimitConfig::default(),
            crate::middleware::rate_limit::RateLimitConfig {
                max_requests: 100,
                window: Duration::from_secs(60),
            },
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            sealer,
            identity,
            authserver,
            oauth_client,
            mobile_allowlist,
            circuit_breaker,
            dpop_nonce_cache: Arc::new(crate::dpop::DpopNonceCache::new()),
            rate_limit,
        })
    }

    /// Spawn the periodic cleanup of expired request/session rows and rate-limit entries.
    pub fn start_cleanup_task(&self) {
        let store = self.store.clone();
        let rate_limit = self.rate_limit.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                match store.cleanup_expired_requests().await {
                    Ok(n) if n > 0 => tracing::debug!(rows = n, "cleaned up expired oauth requests"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "oauth request cleanup failed"),
                }
                match store.cleanup_expired_sessions().await {
                    Ok(n) if n > 0 => tracing::debug!(rows = n, "cleaned up expired oauth sessions"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "oauth session cleanup failed"),
                }
                rate_limit.session_limiter.cleanup(Duration::from_secs(120)).await;
                rate_limit.ip_limiter.cleanup(Duration::from_secs(120)).await;
            }
        });
    }
}
