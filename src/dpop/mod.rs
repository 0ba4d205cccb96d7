//! DPoP Proof Builder (RFC 9449).
//!
//! Grounded on the jacquard-oauth `dpop` module's proof construction and
//! nonce-retry shape: a signed `dpop+jwt` carrying the bound public key in
//! its header, and a per-authority nonce cache that lets the OAuth Client
//! Core retry exactly once when the server challenges with a fresh nonce.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use p256::SecretKey;
use reqwest::StatusCode;
use serde_json::json;

use crate::crypto::{base64url_encode, public_jwk_for, random_bytes, sha256, sign_es256_raw};
use crate::error::{AppError, AppResult};

/// Build a DPoP proof JWT for one outbound request.
///
/// `nonce` and `access_token` are included only when present, per RFC 9449
/// §4.2 (the header never carries the private key; the body never carries
/// the raw access token, only its hash).
pub fn build_dpop_proof(
    secret_key: &SecretKey,
    method: &str,
    uri: &str,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> AppResult<String> {
    let header = json!({
        "alg": "ES256",
        "typ": "dpop+jwt",
        "jwk": public_jwk_for(secret_key, None),
    });

    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::Crypto(format!("system clock before epoch: {e}")))?
        .as_secs();
    let jti = base64url_encode(&random_bytes::<16>());

    let mut claims = json!({
        "htm": method,
        "htu": uri,
        "iat": iat,
        "jti": jti,
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    if let Some(access_token) = access_token {
        let ath = base64url_encode(&sha256(access_token.as_bytes()));
        claims["ath"] = json!(ath);
    }

    let header_b64 = base64url_encode(header.to_string().as_bytes());
    let claims_b64 = base64url_encode(claims.to_string().as_bytes());
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = sign_es256_raw(secret_key, signing_input.as_bytes());
    let signature_b64 = base64url_encode(&signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Per-authority (scheme://host[:port]) cache of the most recently offered
/// DPoP nonce, so subsequent calls to the same server don't need to eat a
/// challenge round-trip every time.
#[derive(Default)]
pub struct DpopNonceCache {
    nonces: DashMap<String, String>,
}

impl DpopNonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, authority: &str) -> Option<String> {
        self.nonces.get(authority).map(|v| v.clone())
    }

    pub fn set(&self, authority: &str, nonce: String) {
        self.nonces.insert(authority.to_string(), nonce);
    }
}

/// A detected `use_dpop_nonce` challenge, carrying the fresh nonce to retry with.
pub struct NonceChallenge {
    pub nonce: String,
}

/// Inspect a response for a DPoP nonce challenge.
///
/// Two shapes are recognized, both from RFC 9449 §8:
/// - Authorization-server style: 400 response whose JSON body has
///   `"error": "use_dpop_nonce"`, with the new nonce in the `DPoP-Nonce`
///   response header.
/// - Resource-server style: 401 response carrying a `DPoP-Nonce` header
///   (optionally alongside a `WWW-Authenticate: DPoP error="use_dpop_nonce"`).
pub fn detect_nonce_challenge(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &[u8],
) -> Option<NonceChallenge> {
    let nonce_header = headers
        .get("DPoP-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())?;

    if status == StatusCode::BAD_REQUEST {
        let is_use_dpop_nonce = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(|s| s.to_string()))
            .map(|e| e == "use_dpop_nonce")
            .unwrap_or(false);
        if is_use_dpop_nonce {
            return Some(NonceChallenge { nonce: nonce_header });
        }
        return None;
    }

    if status == StatusCode::UNAUTHORIZED {
        return Some(NonceChallenge { nonce: nonce_header });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_p256_key;

    #[test]
    fn proof_header_has_no_private_component() {
        let key = generate_p256_key();
        let proof = build_dpop_proof(&key, "POST", "https://issuer/par", None, None).unwrap();
        let mut parts = proof.split('.');
        let header_b64 = parts.next().unwrap();
        let header_json: serde_json::Value =
            serde_json::from_slice(&crate::crypto::base64url_decode(header_b64).unwrap()).unwrap();
        assert_eq!(header_json["alg"], "ES256");
        assert_eq!(header_json["typ"], "dpop+jwt");
        assert_eq!(header_json["jwk"]["kty"], "EC");
        assert_eq!(header_json["jwk"]["crv"], "P-256");
        assert!(header_json["jwk"].get("d").is_none());
    }

    #[test]
    fn proof_claims_contain_required_fields() {
        let key = generate_p256_key();
        let proof = build_dpop_proof(&key, "POST", "https://issuer/par", None, None).unwrap();
        let claims_b64 = proof.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&crate::crypto::base64url_decode(claims_b64).unwrap()).unwrap();
        assert_eq!(claims["htm"], "POST");
        assert_eq!(claims["htu"], "https://issuer/par");
        assert!(claims["iat"].is_u64());
        assert!(claims["jti"].is_string());
        assert!(claims.get("nonce").is_none());
        assert!(claims.get("ath").is_none());
    }

    #[test]
    fn proof_includes_nonce_and_ath_when_provided() {
        let key = generate_p256_key();
        let proof = build_dpop_proof(
            &key,
            "POST",
            "https://issuer/token",
            Some("server-nonce"),
            Some("access-token-value"),
        )
        .unwrap();
        let claims_b64 = proof.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&crate::crypto::base64url_decode(claims_b64).unwrap()).unwrap();
        assert_eq!(claims["nonce"], "server-nonce");
        let expected_ath = base64url_encode(&sha256(b"access-token-value"));
        assert_eq!(claims["ath"], expected_ath);
    }

    #[test]
    fn two_proofs_have_distinct_jti() {
        let key = generate_p256_key();
        let a = build_dpop_proof(&key, "POST", "https://issuer/par", None, None).unwrap();
        let b = build_dpop_proof(&key, "POST", "https://issuer/par", None, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn nonce_cache_roundtrip() {
        let cache = DpopNonceCache::new();
        assert!(cache.get("issuer.example").is_none());
        cache.set("issuer.example", "n1".to_string());
        assert_eq!(cache.get("issuer.example").as_deref(), Some("n1"));
    }

    #[test]
    fn detects_authserver_style_challenge() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("DPoP-Nonce", "abc123".parse().unwrap());
        let body = br#"{"error":"use_dpop_nonce"}"#;
        let challenge = detect_nonce_challenge(StatusCode::BAD_REQUEST, &headers, body).unwrap();
        assert_eq!(challenge.nonce, "abc123");
    }

    #[test]
    fn detects_resource_server_style_challenge() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("DPoP-Nonce", "xyz789".parse().unwrap());
        let challenge = detect_nonce_challenge(StatusCode::UNAUTHORIZED, &headers, b"").unwrap();
        assert_eq!(challenge.nonce, "xyz789");
    }

    #[test]
    fn no_challenge_without_nonce_header() {
        let headers = reqwest::header::HeaderMap::new();
        assert!(detect_nonce_challenge(StatusCode::BAD_REQUEST, &headers, b"{}").is_none());
    }
}
