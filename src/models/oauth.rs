//! OAuthRequest and OAuthSession row types (§3 of the data model), plus the
//! wire shape of an authorization-server token response.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Short-lived pending-authorization row, keyed by `state`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OAuthRequest {
    pub state: String,
    pub did: Option<String>,
    pub handle: String,
    pub pds_url: String,
    pub auth_server_issuer: String,
    pub auth_server_token_endpoint: String,
    pub pkce_verifier: String,
    pub dpop_private_key_multibase: String,
    pub dpop_authserver_nonce: Option<String>,
    pub request_uri: String,
    pub scopes: Vec<String>,
    pub return_url: Option<String>,
    pub mobile_csrf_token: Option<String>,
    pub mobile_redirect_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Long-lived authenticated-user row, keyed by `(did, session_id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OAuthSession {
    pub did: String,
    pub session_id: String,
    pub handle: String,
    pub pds_url: String,
    pub host_url: String,
    pub auth_server_issuer: String,
    pub auth_server_token_endpoint: String,
    pub auth_server_revocation_endpoint: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub dpop_private_key_multibase: String,
    pub dpop_authserver_nonce: Option<String>,
    pub dpop_pds_nonce: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The server-side mobile-flow cross-check data (§4.11 step 5): the same two
/// fields an `OAuthRequest` carries for a mobile-initiated flow, read
/// without consuming the row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MobileFlow {
    pub mobile_csrf_token: Option<String>,
    pub mobile_redirect_uri: Option<String>,
}

/// Authorization-server token response (PAR/token/refresh endpoints).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub sub: Option<String>,
}
