//! Web/Mobile Flow Orchestrator: login, callback, logout, refresh, and the
//! client-metadata/JWKS discovery endpoints.
//!
//! Grounded on the reference gateway's ATProto OAuth handlers for the
//! overall login→callback→session shape, generalized to PAR+DPoP via the
//! OAuth Client Core and to the mobile safety layer via `mobile::validate_mobile_callback`.
//! The state machine (`NEW → ... → DELIVERED`, aborting to `ABORTED` on any
//! fatal failure) is implicit in this module's control flow rather than an
//! explicit enum: a request row only ever leaves the store via
//! `get_and_delete_request`, so a crash mid-flow just leaves an abandoned
//! row for the cleanup task to reap.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AppState;
use crate::crypto::{deserialize_secret_key, generate_p256_key, serialize_secret_key};
use crate::error::{AppError, AppResult};
use crate::identity::HANDLE_INVALID;
use crate::metrics;
use crate::middleware::SESSION_COOKIE_NAME;
use crate::mobile::{self, MobileCookieState, MobileCookies, MobileValidationOutcome, ServerMobileFlow};
use crate::models::OAuthRequest;

/// How long a sealed token remains valid. This is an opaque session
/// locator, not the access token itself, so it outlives individual
/// access/refresh token lifetimes; the underlying session is refreshed
/// server-side via `POST /oauth/refresh`.
const SEALED_TOKEN_TTL: Duration = Duration::days(30);
const MOBILE_COOKIE_TTL: Duration = Duration::minutes(10);
const OAUTH_CSRF_COOKIE: &str = "oauth_csrf";
const MOBILE_REDIRECT_URI_COOKIE: &str = "mobile_redirect_uri";
const MOBILE_REDIRECT_BINDING_COOKIE: &str = "mobile_redirect_binding";

fn normalize_handle(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim().trim_start_matches('@').to_lowercase();
    if trimmed.is_empty() || !trimmed.contains('.') {
        return Err(AppError::InputValidation(
            "handle must be a non-empty domain-like string".to_string(),
        ));
    }
    Ok(trimmed)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub handle: String,
    #[serde(rename = "returnUrl")]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(rename = "authorizationUrl")]
    pub authorization_url: String,
    pub state: String,
}

/// The shared "resolve identity, discover auth server, send PAR" sequence
/// used by both the web and mobile login entry points (§4.9 steps 1-4).
struct PendingLogin {
    did: String,
    handle: String,
    pds_url: String,
    auth_server_issuer: String,
    auth_server_token_endpoint: String,
    request_uri: String,
    state: String,
    pkce_verifier: String,
    authserver_nonce: Option<String>,
    dpop_private_key_multibase: String,
    authorization_endpoint: String,
}

async fn start_login(state: &AppState, handle: &str) -> AppResult<PendingLogin> {
    let handle = normalize_handle(handle)?;

    let did = state.identity.resolve_handle(&handle).await?;
    let pds_url = state.identity.resolve_pds(&did).await?;
    let authserver = state.authserver.discover(&pds_url).await?;

    let dpop_key = generate_p256_key();
    let scope = state.config.oauth.scopes.join(" ");
    let outcome = state
        .oauth_client
        .send_par(&authserver, Some(&handle), &scope, &dpop_key, &state.dpop_nonce_cache)
        .await?;

    Ok(PendingLogin {
        did,
        handle,
        pds_url,
        auth_server_issuer: authserver.issuer.clone(),
        auth_server_token_endpoint: authserver.token_endpoint.clone(),
        request_uri: outcome.request_uri,
        state: outcome.state,
        pkce_verifier: outcome.pkce_verifier,
        authserver_nonce: outcome.authserver_nonce,
        dpop_private_key_multibase: serialize_secret_key(&dpop_key),
        authorization_endpoint: authserver.authorization_endpoint,
    })
}

fn authorization_url(pending: &PendingLogin, client_id: &str) -> String {
    format!(
        "{}?client_id={}&request_uri={}",
        pending.authorization_endpoint,
        urlencode(client_id),
        urlencode(&pending.request_uri)
    )
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~' | ':' | '/') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

/// `POST /oauth/login` — web login entry point.
pub async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginRequest>) -> AppResult<impl IntoResponse> {
    let pending = start_login(&state, &body.handle).await?;
    let authorization_url = authorization_url(&pending, &state.config.oauth.client_id);

    let req = OAuthRequest {
        state: pending.state.clone(),
        did: Some(pending.did),
        handle: pending.handle,
        pds_url: pending.pds_url,
        auth_server_issuer: pending.auth_server_issuer,
        auth_server_token_endpoint: pending.auth_server_token_endpoint,
        pkce_verifier: pending.pkce_verifier,
        dpop_private_key_multibase: pending.dpop_private_key_multibase,
        dpop_authserver_nonce: pending.authserver_nonce,
        request_uri: pending.request_uri,
        scopes: state.config.oauth.scopes.clone(),
        return_url: body.return_url,
        mobile_csrf_token: None,
        mobile_redirect_uri: None,
        created_at: Utc::now(),
    };
    state.store.save_request(&req).await?;

    Ok(Json(LoginResponse {
        authorization_url,
        state: req.state,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MobileLoginQuery {
    pub handle: String,
    pub redirect_uri: String,
}

/// `GET /oauth/mobile/login` — sets the mobile safety-layer cookie triple
/// and 302s straight to the authorization endpoint.
pub async fn mobile_login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MobileLoginQuery>,
    jar: CookieJar,
) -> AppResult<impl IntoResponse> {
    if !state.mobile_allowlist.is_allowed(&query.redirect_uri) {
        return Err(AppError::Security("redirect_uri not in allowlist".to_string()));
    }

    let pending = start_login(&state, &query.handle).await?;
    let authorization_url = authorization_url(&pending, &state.config.oauth.client_id);

    let csrf_token = mobile::generate_csrf_token();
    let binding = mobile::compute_redirect_binding(&csrf_token, &query.redirect_uri);

    let req = OAuthRequest {
        state: pending.state.clone(),
        did: Some(pending.did),
        handle: pending.handle,
        pds_url: pending.pds_url,
        auth_server_issuer: pending.auth_server_issuer,
        auth_server_token_endpoint: pending.auth_server_token_endpoint,
        pkce_verifier: pending.pkce_verifier,
        dpop_private_key_multibase: pending.dpop_private_key_multibase,
        dpop_authserver_nonce: pending.authserver_nonce,
        request_uri: pending.request_uri,
        scopes: state.config.oauth.scopes.clone(),
        return_url: None,
        mobile_csrf_token: Some(csrf_token.clone()),
        mobile_redirect_uri: Some(query.redirect_uri.clone()),
        created_at: Utc::now(),
    };
    state.store.save_request(&req).await?;

    let secure = state.config.is_production();
    let jar = jar
        .add(mobile_cookie(OAUTH_CSRF_COOKIE, csrf_token, secure))
        .add(mobile_cookie(MOBILE_REDIRECT_URI_COOKIE, query.redirect_uri, secure))
        .add(mobile_cookie(MOBILE_REDIRECT_BINDING_COOKIE, binding, secure));

    Ok((jar, Redirect::to(&authorization_url)))
}

fn mobile_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/oauth")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::seconds(MOBILE_COOKIE_TTL.num_seconds()))
        .build()
}

fn clear_mobile_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(OAUTH_CSRF_COOKIE).path("/oauth").build())
        .remove(Cookie::build(MOBILE_REDIRECT_URI_COOKIE).path("/oauth").build())
        .remove(Cookie::build(MOBILE_REDIRECT_BINDING_COOKIE).path("/oauth").build())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub iss: Option<String>,
}

/// `GET /oauth/callback` — handles both the web and mobile flavors,
/// discriminated by the presence of the mobile cookie triple (§4.11).
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    jar: CookieJar,
) -> AppResult<Response> {
    let (Some(code), Some(oauth_state), Some(iss)) = (query.code, query.state, query.iss) else {
        return Err(AppError::InputValidation(
            "callback requires code, state, and iss".to_string(),
        ));
    };

    // Mobile-flow data must be read before get_and_delete_request consumes
    // the row (§5 ordering guarantee).
    let server_flow = state
        .store
        .get_mobile_flow(&oauth_state)
        .await?
        .map(|f| ServerMobileFlow {
            csrf_token: f.mobile_csrf_token.unwrap_or_default(),
            redirect_uri: f.mobile_redirect_uri.unwrap_or_default(),
        });

    let cookie_state = match (
        jar.get(OAUTH_CSRF_COOKIE),
        jar.get(MOBILE_REDIRECT_URI_COOKIE),
        jar.get(MOBILE_REDIRECT_BINDING_COOKIE),
    ) {
        (Some(csrf), Some(redirect_uri), Some(binding)) => MobileCookieState::Present(MobileCookies {
            csrf: csrf.value().to_string(),
            redirect_uri: redirect_uri.value().to_string(),
            redirect_binding: binding.value().to_string(),
        }),
        (None, Some(_), _) => MobileCookieState::MissingCsrf,
        _ => MobileCookieState::Absent,
    };

    let mobile_outcome = mobile::validate_mobile_callback(&cookie_state, server_flow.as_ref(), &state.mobile_allowlist);
    match &mobile_outcome {
        MobileValidationOutcome::Reject(reason) => {
            tracing::warn!(reason, "mobile callback rejected: oauth_csrf cookie missing");
            metrics::record_oauth_login(false);
            return Ok((clear_mobile_cookies(jar), StatusCode::FORBIDDEN).into_response());
        }
        MobileValidationOutcome::WebFallback(reason) => {
            if matches!(cookie_state, MobileCookieState::Present(_)) {
                tracing::warn!(reason, "mobile callback validation failed, falling back to web flow");
            }
        }
        MobileValidationOutcome::DeliverToMobile(_) => {}
    }

    let req = match state.store.get_and_delete_request(&oauth_state).await {
        Ok(req) => req,
        Err(e) => {
            metrics::record_oauth_login(false);
            return Ok((clear_mobile_cookies(jar), e).into_response());
        }
    };

    let result = complete_callback(&state, &req, &code, &iss).await;
    let jar = clear_mobile_cookies(jar);

    match result {
        Ok((sealed_token, session_id, did)) => {
            metrics::record_oauth_login(true);
            match mobile_outcome {
                MobileValidationOutcome::DeliverToMobile(redirect_uri) => {
                    let target = format!(
                        "{redirect_uri}?sealed_token={}&did={}&session_id={}",
                        urlencode(&sealed_token),
                        urlencode(&did),
                        urlencode(&session_id)
                    );
                    Ok((jar, Redirect::to(&target)).into_response())
                }
                MobileValidationOutcome::WebFallback(_) => {
                    let secure = state.config.is_production();
                    let session_cookie = Cookie::build((SESSION_COOKIE_NAME, sealed_token))
                        .path("/")
                        .http_only(true)
                        .same_site(SameSite::Lax)
                        .secure(secure)
                        .max_age(time::Duration::seconds(SEALED_TOKEN_TTL.num_seconds()))
                        .build();
                    let jar = jar.add(session_cookie);
                    let target = req.return_url.unwrap_or_else(|| "/".to_string());
                    Ok((jar, Redirect::to(&target)).into_response())
                }
                MobileValidationOutcome::Reject(_) => unreachable!("Reject returns before the request row is consumed"),
            }
        }
        Err(e) => {
            metrics::record_oauth_login(false);
            Ok((jar, e).into_response())
        }
    }
}

/// Steps 3-7 of the callback state machine (§4.9): issuer check, token
/// exchange, sub/type assertions, bidirectional handle verification,
/// session persistence, and sealing. Returns `(sealed_token, session_id, did)`.
async fn complete_callback(
    state: &AppState,
    req: &OAuthRequest,
    code: &str,
    iss: &str,
) -> AppResult<(String, String, String)> {
    if iss != req.auth_server_issuer {
        return Err(AppError::Protocol(format!(
            "callback iss mismatch: expected {}, got {iss}",
            req.auth_server_issuer
        )));
    }

    let did = req
        .did
        .clone()
        .ok_or_else(|| AppError::Protocol("oauth request missing resolved did".to_string()))?;

    let authserver = state.authserver.discover(&req.pds_url).await?;
    let dpop_key = deserialize_secret_key(&req.dpop_private_key_multibase)?;

    let token_response = state
        .oauth_client
        .exchange_code(&authserver, code, &req.pkce_verifier, &dpop_key, &state.dpop_nonce_cache)
        .await?;

    if let Some(sub) = &token_response.sub {
        if *sub != did {
            return Err(AppError::Protocol(format!(
                "token response sub mismatch: expected {did}, got {sub}"
            )));
        }
    }

    let verified_handle = state.identity.verify_handle(&did, &req.handle).await?;
    if verified_handle == HANDLE_INVALID {
        metrics::record_handle_verification_failure("callback");
        return Err(AppError::HandleVerification(format!(
            "handle {} could not be re-verified for {did}",
            req.handle
        )));
    }

    let session_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::seconds(token_response.expires_in.unwrap_or(3600));

    let session = crate::models::OAuthSession {
        did: did.clone(),
        session_id: session_id.clone(),
        handle: verified_handle,
        pds_url: req.pds_url.clone(),
        host_url: req.pds_url.clone(),
        auth_server_issuer: authserver.issuer,
        auth_server_token_endpoint: authserver.token_endpoint,
        auth_server_revocation_endpoint: authserver.revocation_endpoint,
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        dpop_private_key_multibase: req.dpop_private_key_multibase.clone(),
        dpop_authserver_nonce: state.dpop_nonce_cache.get(&authority_of_issuer(&req.auth_server_issuer)),
        dpop_pds_nonce: None,
        scopes: req.scopes.clone(),
        expires_at,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    state.store.save_session(&session).await?;

    let sealed_token = state.sealer.seal(&did, &session_id, SEALED_TOKEN_TTL)?;
    Ok((sealed_token, session_id, did))
}

fn authority_of_issuer(issuer: &str) -> String {
    url::Url::parse(issuer)
        .ok()
        .and_then(|u| u.host_str().map(|h| match u.port() {
            Some(p) => format!("{h}:{p}"),
            None => h.to_string(),
        }))
        .unwrap_or_else(|| issuer.to_string())
}

/// `POST /oauth/logout` — best-effort revocation, always clears cookies.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    session: Option<axum::Extension<crate::models::OAuthSession>>,
    jar: CookieJar,
) -> impl IntoResponse {
    if let Some(axum::Extension(session)) = session {
        if let Ok(authserver) = state.authserver.discover(&session.pds_url).await {
            if let Ok(dpop_key) = deserialize_secret_key(&session.dpop_private_key_multibase) {
                let _ = state
                    .oauth_client
                    .revoke(&authserver, &session.access_token, &dpop_key, &state.dpop_nonce_cache)
                    .await;
            }
        }
        let _ = state.store.delete_session(&session.did, &session.session_id).await;
    }

    let jar = jar.remove(Cookie::build(SESSION_COOKIE_NAME).path("/").build());
    (jar, Redirect::to("/"))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub did: String,
    pub session_id: String,
    pub sealed_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub sealed_token: String,
}

/// `POST /oauth/refresh` — mobile clients resume a session by presenting
/// the sealed token alongside the did/session_id it should unseal to.
pub async fn refresh(State(state): State<Arc<AppState>>, Json(body): Json<RefreshRequest>) -> AppResult<impl IntoResponse> {
    let unsealed = state.sealer.unseal(&body.sealed_token)?;
    if unsealed.did != body.did || unsealed.session_id != body.session_id {
        return Err(AppError::Security("sealed token does not match submitted did/session_id".to_string()));
    }

    let session = state.store.get_session(&body.did, &body.session_id).await?;
    let Some(refresh_token) = session.refresh_token.clone() else {
        return Err(AppError::Protocol("session has no refresh token".to_string()));
    };

    let authserver = state.authserver.discover(&session.pds_url).await?;
    let dpop_key = deserialize_secret_key(&session.dpop_private_key_multibase)?;

    let token_response = match state
        .oauth_client
        .refresh_tokens(&authserver, &refresh_token, &dpop_key, &state.dpop_nonce_cache)
        .await
    {
        Ok(t) => {
            metrics::record_token_refresh(true);
            t
        }
        Err(e) => {
            metrics::record_token_refresh(false);
            return Err(e);
        }
    };

    let new_exp = Utc::now() + Duration::seconds(token_response.expires_in.unwrap_or(3600));
    state
        .store
        .refresh_session(
            &body.did,
            &body.session_id,
            &token_response.access_token,
            token_response.refresh_token.as_deref(),
            new_exp,
        )
        .await?;

    let sealed_token = state.sealer.seal(&body.did, &body.session_id, SEALED_TOKEN_TTL)?;

    Ok(Json(RefreshResponse {
        access_token: token_response.access_token,
        sealed_token,
    }))
}

/// `GET /oauth/client-metadata.json` — RFC 7591 subset describing this
/// confidential client.
pub async fn client_metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let base_url = state.config.server.base_url.trim_end_matches('/');
    Json(json!({
        "client_id": state.config.oauth.client_id,
        "client_name": "Coves",
        "client_uri": base_url,
        "redirect_uris": [state.config.oauth.redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "scope": state.config.oauth.scopes.join(" "),
        "token_endpoint_auth_method": "private_key_jwt",
        "token_endpoint_auth_signing_alg": "ES256",
        "dpop_bound_access_tokens": true,
        "application_type": "web",
        "jwks_uri": format!("{base_url}/oauth/jwks.json"),
    }))
}

/// `GET /oauth/jwks.json` — this client's public signing key.
pub async fn jwks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.oauth_client.jwks()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handle_strips_at_and_lowercases() {
        assert_eq!(normalize_handle("@Alice.Example").unwrap(), "alice.example");
        assert_eq!(normalize_handle("  bob.example  ").unwrap(), "bob.example");
    }

    #[test]
    fn normalize_handle_rejects_empty_and_bare() {
        assert!(normalize_handle("").is_err());
        assert!(normalize_handle("nodomain").is_err());
        assert!(normalize_handle("@").is_err());
    }

    #[test]
    fn urlencode_preserves_unreserved_and_escapes_rest() {
        assert_eq!(urlencode("abc-._~:/123"), "abc-._~:/123");
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
    }

    #[test]
    fn authorization_url_includes_client_id_and_request_uri() {
        let pending = PendingLogin {
            did: "did:plc:abc".to_string(),
            handle: "alice.example".to_string(),
            pds_url: "https://pds.example".to_string(),
            auth_server_issuer: "https://auth.example".to_string(),
            auth_server_token_endpoint: "https://auth.example/token".to_string(),
            request_uri: "urn:ietf:params:oauth:request_uri:abc123".to_string(),
            state: "state-value".to_string(),
            pkce_verifier: "verifier".to_string(),
            authserver_nonce: None,
            dpop_private_key_multibase: "key".to_string(),
            authorization_endpoint: "https://auth.example/authorize".to_string(),
        };
        let url = authorization_url(&pending, "https://coves.app/client-metadata.json");
        assert!(url.starts_with("https://auth.example/authorize?client_id="));
        assert!(url.contains("request_uri=urn:ietf:params:oauth:request_uri:abc123"));
    }

    #[test]
    fn authority_of_issuer_extracts_host_and_port() {
        assert_eq!(authority_of_issuer("https://auth.example"), "auth.example");
        assert_eq!(authority_of_issuer("https://auth.example:8443/"), "auth.example:8443");
        assert_eq!(authority_of_issuer("not a url"), "not a url");
    }
}
