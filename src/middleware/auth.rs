//! Session-extraction middleware: unseals the `session` cookie (or a
//! mobile client's `Authorization: Bearer` sealed token), loads the
//! corresponding `OAuthSession` row, and attaches it to the request's
//! extensions so downstream handlers can pull it out with axum's
//! `Extension<OAuthSession>` extractor.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;

use crate::config::AppState;
use crate::models::OAuthSession;

pub const SESSION_COOKIE_NAME: &str = "session";

fn extract_sealed_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    let jar = CookieJar::from_headers(req.headers());
    jar.get(SESSION_COOKIE_NAME).map(|c| c.value().to_string())
}

async fn load_session(state: &AppState, sealed_token: &str) -> Option<OAuthSession> {
    let unsealed = state.sealer.unseal(sealed_token).ok()?;
    state.store.get_session(&unsealed.did, &unsealed.session_id).await.ok()
}

/// Requires a valid session; responds 401 if none is present.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_sealed_token(&req) else {
        return unauthorized();
    };
    let Some(session) = load_session(&state, &token).await else {
        return unauthorized();
    };
    req.extensions_mut().insert(session);
    next.run(req).await
}

/// Attaches a session if present and valid, but never rejects the request.
pub async fn optional_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(token) = extract_sealed_token(&req) {
        if let Some(session) = load_session(&state, &token).await {
            req.extensions_mut().insert(session);
        }
    }
    next.run(req).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({
            "error": "not_found",
            "message": "no valid session",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_sealed_token_prefers_authorization_header() {
        let req = Request::builder()
            .header("authorization", "Bearer sealed-token-value")
            .header("cookie", format!("{SESSION_COOKIE_NAME}=cookie-token-value"))
            .body(())
            .unwrap();
        assert_eq!(extract_sealed_token(&req).as_deref(), Some("sealed-token-value"));
    }

    #[test]
    fn extract_sealed_token_falls_back_to_cookie() {
        let req = Request::builder()
            .header("cookie", format!("{SESSION_COOKIE_NAME}=cookie-token-value"))
            .body(())
            .unwrap();
        assert_eq!(extract_sealed_token(&req).as_deref(), Some("cookie-token-value"));
    }

    #[test]
    fn extract_sealed_token_none_when_absent() {
        let req = Request::builder().body(()).unwrap();
        assert!(extract_sealed_token(&req).is_none());
    }
}
