//! Mobile Safety Layer: exact-match redirect allowlist, CSRF token, and
//! redirect-binding cookies protecting the deep-link delivery path from
//! cross-flow attacks, CSRF, and cookie tampering.
//!
//! No single teacher file covers this protocol end to end; the constant-time
//! comparison and cookie-clearing discipline follow the defensive style of
//! the reference gateway's session-cookie handling (`routes/health.rs`'s
//! unconditional-clear-on-failure pattern) generalized to the ordered
//! six-step validation this callback requires.

use subtle::ConstantTimeEq;

use crate::crypto::{base64url_encode, random_bytes, sha256};

/// Compile-time-configured allowlist of mobile redirect targets (Universal
/// Link HTTPS URL, optional reverse-domain custom scheme). Matched
/// exact-string, never by prefix or pattern.
#[derive(Debug, Clone)]
pub struct MobileRedirectAllowlist {
    allowed: Vec<String>,
}

impl MobileRedirectAllowlist {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn is_allowed(&self, redirect_uri: &str) -> bool {
        self.allowed.iter().any(|a| a == redirect_uri)
    }
}

pub fn generate_csrf_token() -> String {
    base64url_encode(&random_bytes::<32>())
}

/// `base64url(SHA-256(csrf_token || "|" || mobile_redirect_uri))[:16]`.
pub fn compute_redirect_binding(csrf_token: &str, mobile_redirect_uri: &str) -> String {
    let mut input = Vec::with_capacity(csrf_token.len() + 1 + mobile_redirect_uri.len());
    input.extend_from_slice(csrf_token.as_bytes());
    input.push(b'|');
    input.extend_from_slice(mobile_redirect_uri.as_bytes());
    let digest = sha256(&input);
    let encoded = base64url_encode(&digest);
    encoded.chars().take(16).collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// The cookies a mobile-initiated login carries through the callback.
#[derive(Debug, Clone)]
pub struct MobileCookies {
    pub csrf: String,
    pub redirect_uri: String,
    pub redirect_binding: String,
}

/// How much of the mobile cookie triple the callback request carried.
#[derive(Debug, Clone)]
pub enum MobileCookieState {
    /// No mobile cookies at all; a plain web-initiated login.
    Absent,
    /// `mobile_redirect_uri` present but `oauth_csrf` missing — the CSRF
    /// cookie is the one this layer can't do without, so treat this as an
    /// attack signature rather than a degraded mobile flow.
    MissingCsrf,
    /// All three cookies present.
    Present(MobileCookies),
}

/// The server-side mobile-flow row (§4.5 `get_mobile_flow`), read before the
/// `oauth_requests` row is consumed.
#[derive(Debug, Clone)]
pub struct ServerMobileFlow {
    pub csrf_token: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileValidationOutcome {
    /// All six checks passed; deliver via deep link to this URI.
    DeliverToMobile(String),
    /// Not a mobile flow, or validation failed; fall back to the web path.
    /// Carries the reason for logging; cookies must be cleared by the caller.
    WebFallback(&'static str),
    /// The CSRF-missing attack signature; reject outright instead of issuing
    /// a session. Cookies must be cleared by the caller.
    Reject(&'static str),
}

/// Run the full ordered callback validation (§4.11 steps 1-6).
pub fn validate_mobile_callback(
    cookie_state: &MobileCookieState,
    server_flow: Option<&ServerMobileFlow>,
    allowlist: &MobileRedirectAllowlist,
) -> MobileValidationOutcome {
    // Step 1: not a mobile flow, or the CSRF-missing attack signature.
    let cookies = match cookie_state {
        MobileCookieState::Absent => {
            return MobileValidationOutcome::WebFallback("not a mobile-initiated flow");
        }
        MobileCookieState::MissingCsrf => {
            return MobileValidationOutcome::Reject("mobile_redirect_uri present without oauth_csrf cookie");
        }
        MobileCookieState::Present(cookies) => cookies,
    };

    // Step 2: a full mobile cookie triple with no matching server-side row
    // is the cross-flow-attack signature — always fail closed to web.
    let Some(server_flow) = server_flow else {
        return MobileValidationOutcome::WebFallback("mobile cookie present without server-side flow row");
    };

    // Step 3.
    if !allowlist.is_allowed(&cookies.redirect_uri) {
        return MobileValidationOutcome::WebFallback("redirect_uri not in allowlist");
    }

    // Step 4.
    let expected_binding = compute_redirect_binding(&cookies.csrf, &cookies.redirect_uri);
    if !constant_time_eq(&expected_binding, &cookies.redirect_binding) {
        return MobileValidationOutcome::WebFallback("redirect binding mismatch");
    }

    // Step 5.
    if !constant_time_eq(&server_flow.csrf_token, &cookies.csrf) {
        return MobileValidationOutcome::WebFallback("csrf token mismatch between cookie and server row");
    }
    if server_flow.redirect_uri != cookies.redirect_uri {
        return MobileValidationOutcome::WebFallback("redirect_uri mismatch between cookie and server row");
    }

    // Step 6.
    MobileValidationOutcome::DeliverToMobile(cookies.redirect_uri.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> MobileRedirectAllowlist {
        MobileRedirectAllowlist::new(vec![
            "https://coves.app/oauth/callback".to_string(),
            "app.coves.ios://oauth/callback".to_string(),
        ])
    }

    fn valid_flow() -> (MobileCookies, ServerMobileFlow) {
        let csrf = "csrf-token-value".to_string();
        let redirect_uri = "https://coves.app/oauth/callback".to_string();
        let binding = compute_redirect_binding(&csrf, &redirect_uri);
        (
            MobileCookies {
                csrf: csrf.clone(),
                redirect_uri: redirect_uri.clone(),
                redirect_binding: binding,
            },
            ServerMobileFlow { csrf_token: csrf, redirect_uri },
        )
    }

    #[test]
    fn happy_path_delivers_to_mobile() {
        let (cookies, flow) = valid_flow();
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), Some(&flow), &allowlist());
        assert_eq!(
            outcome,
            MobileValidationOutcome::DeliverToMobile("https://coves.app/oauth/callback".to_string())
        );
    }

    #[test]
    fn no_cookies_is_plain_web_flow() {
        let outcome = validate_mobile_callback(&MobileCookieState::Absent, None, &allowlist());
        assert!(matches!(outcome, MobileValidationOutcome::WebFallback(_)));
    }

    #[test]
    fn missing_csrf_cookie_is_rejected() {
        let outcome = validate_mobile_callback(&MobileCookieState::MissingCsrf, None, &allowlist());
        assert_eq!(
            outcome,
            MobileValidationOutcome::Reject("mobile_redirect_uri present without oauth_csrf cookie")
        );
    }

    #[test]
    fn cookie_without_server_row_is_cross_flow_attack() {
        let (cookies, _) = valid_flow();
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), None, &allowlist());
        assert_eq!(outcome, MobileValidationOutcome::WebFallback("mobile cookie present without server-side flow row"));
    }

    #[test]
    fn redirect_uri_not_allowlisted_rejected() {
        let (mut cookies, mut flow) = valid_flow();
        cookies.redirect_uri = "https://evil.example/callback".to_string();
        flow.redirect_uri = cookies.redirect_uri.clone();
        cookies.redirect_binding = compute_redirect_binding(&cookies.csrf, &cookies.redirect_uri);
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), Some(&flow), &allowlist());
        assert_eq!(outcome, MobileValidationOutcome::WebFallback("redirect_uri not in allowlist"));
    }

    #[test]
    fn tampered_binding_rejected() {
        let (mut cookies, flow) = valid_flow();
        cookies.redirect_binding = "tampered-binding-value".to_string();
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), Some(&flow), &allowlist());
        assert_eq!(outcome, MobileValidationOutcome::WebFallback("redirect binding mismatch"));
    }

    #[test]
    fn csrf_mismatch_between_cookie_and_row_rejected() {
        let (cookies, mut flow) = valid_flow();
        flow.csrf_token = "different-csrf".to_string();
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), Some(&flow), &allowlist());
        assert_eq!(
            outcome,
            MobileValidationOutcome::WebFallback("csrf token mismatch between cookie and server row")
        );
    }

    #[test]
    fn redirect_uri_mismatch_between_cookie_and_row_rejected() {
        let (cookies, mut flow) = valid_flow();
        flow.redirect_uri = "app.coves.ios://oauth/callback".to_string();
        let outcome = validate_mobile_callback(&MobileCookieState::Present(cookies), Some(&flow), &allowlist());
        assert_eq!(
            outcome,
            MobileValidationOutcome::WebFallback("redirect_uri mismatch between cookie and server row")
        );
    }

    #[test]
    fn binding_is_deterministic() {
        let a = compute_redirect_binding("token", "https://x.example/cb");
        let b = compute_redirect_binding("token", "https://x.example/cb");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
