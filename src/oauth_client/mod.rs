//! OAuth Client Core: PAR, token exchange, refresh, and revocation against a
//! discovered authorization server, all DPoP-bound with nonce-retry-once
//! semantics and `private_key_jwt` client authentication (RFC 7523).
//!
//! Grounded on the jacquard-oauth `request.rs` reference file's `par`,
//! `refresh`, `exchange_code`, `revoke`, and `build_auth` functions — the
//! JWT-bearer client assertion shape (`iss`/`sub`=client_id, `aud`=issuer,
//! short `exp`, mandatory `jti`) is carried over unchanged; the DPoP
//! nonce-retry loop is reimplemented here against this crate's own
//! `dpop` module rather than jacquard's `DpopExt` trait.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use p256::SecretKey;
use serde_json::json;

use crate::authserver::AuthServerMetadata;
use crate::crypto::{base64url_encode, random_bytes, OAuthSigningKey};
use crate::dpop::{build_dpop_proof, detect_nonce_challenge, DpopNonceCache};
use crate::error::{AppError, AppResult};
use crate::http_client::SsrfSafeClient;
use crate::models::TokenResponse;
use crate::pkce::{generate_pkce, generate_state};

const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub struct ParOutcome {
    pub request_uri: String,
    pub state: String,
    pub pkce_verifier: String,
    pub authserver_nonce: Option<String>,
}

pub struct OAuthClientCore {
    client: SsrfSafeClient,
    signing_key: OAuthSigningKey,
    client_id: String,
    redirect_uri: String,
}

impl OAuthClientCore {
    pub fn new(client: SsrfSafeClient, signing_key: OAuthSigningKey, client_id: String, redirect_uri: String) -> Self {
        Self {
            client,
            signing_key,
            client_id,
            redirect_uri,
        }
    }

    /// The client's public signing key as a JWKS document, served at
    /// `/oauth/jwks.json` for authorization servers to verify
    /// `private_key_jwt` client assertions against.
    pub fn jwks(&self) -> serde_json::Value {
        self.signing_key.to_jwks()
    }

    fn client_assertion(&self, issuer: &str) -> AppResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AppError::Crypto(format!("system clock before epoch: {e}")))?
            .as_secs() as i64;

        let header = json!({ "alg": "ES256", "typ": "JWT", "kid": self.signing_key.kid });
        let claims = json!({
            "iss": self.client_id,
            "sub": self.client_id,
            "aud": issuer,
            "iat": now,
            "exp": now + 60,
            "jti": base64url_encode(&random_bytes::<16>()),
        });

        let header_b64 = base64url_encode(header.to_string().as_bytes());
        let claims_b64 = base64url_encode(claims.to_string().as_bytes());
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = self.signing_key.sign_es256(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", base64url_encode(&signature)))
    }

    /// `token_endpoint_auth_method` is `private_key_jwt` unless the
    /// authorization server only supports `none` (public-client mode).
    fn auth_params(&self, authserver: &AuthServerMetadata) -> AppResult<HashMap<&'static str, String>> {
        let mut params = HashMap::new();
        params.insert("client_id", self.client_id.clone());

        let supports_private_key_jwt = authserver
            .token_endpoint_auth_methods_supported
            .iter()
            .any(|m| m == "private_key_jwt");
        let supports_none = authserver
            .token_endpoint_auth_methods_supported
            .iter()
            .any(|m| m == "none");

        if supports_private_key_jwt {
            params.insert("client_assertion_type", CLIENT_ASSERTION_TYPE_JWT_BEARER.to_string());
            params.insert("client_assertion", self.client_assertion(&authserver.issuer)?);
        } else if !supports_none {
            return Err(AppError::Protocol(
                "authorization server supports neither private_key_jwt nor none".to_string(),
            ));
        }

        Ok(params)
    }

    /// Send a form-encoded POST with a DPoP proof, retrying exactly once if
    /// the server challenges with a fresh nonce (RFC 9449 §8).
    async fn post_with_dpop_retry(
        &self,
        url: &str,
        form: &HashMap<&'static str, String>,
        dpop_key: &SecretKey,
        nonce_cache: &DpopNonceCache,
        authority: &str,
    ) -> AppResult<reqwest::Response> {
        let cached_nonce = nonce_cache.get(authority);
        let proof = build_dpop_proof(dpop_key, "POST", url, cached_nonce.as_deref(), None)?;

        let resp = self
            .client
            .post(url)
            .header("DPoP", proof)
            .form(form)
            .send()
            .await
            .map_err(|e| self.client.map_send_error(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let headers = resp.headers().clone();
            let body = resp.bytes().await.map_err(|e| self.client.map_send_error(e))?;
            if let Some(challenge) = detect_nonce_challenge(status, &headers, &body) {
                nonce_cache.set(authority, challenge.nonce.clone());
                let retry_proof = build_dpop_proof(dpop_key, "POST", url, Some(&challenge.nonce), None)?;
                return self
                    .client
                    .post(url)
                    .header("DPoP", retry_proof)
                    .form(form)
                    .send()
                    .await
                    .map_err(|e| self.client.map_send_error(e));
            }
            return Err(AppError::Protocol(format!(
                "authorization server rejected request: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(resp)
    }

    pub async fn send_par(
        &self,
        authserver: &AuthServerMetadata,
        login_hint: Option<&str>,
        scope: &str,
        dpop_key: &SecretKey,
        nonce_cache: &DpopNonceCache,
    ) -> AppResult<ParOutcome> {
        let state = generate_state();
        let pkce = generate_pkce();

        let mut form = self.auth_params(authserver)?;
        form.insert("response_type", "code".to_string());
        form.insert("redirect_uri", self.redirect_uri.clone());
        form.insert("state", state.clone());
        form.insert("scope", scope.to_string());
        form.insert("code_challenge", pkce.challenge.clone());
        form.insert("code_challenge_method", "S256".to_string());
        if let Some(hint) = login_hint {
            form.insert("login_hint", hint.to_string());
        }

        let authority = authority_of(&authserver.issuer)?;
        let resp = self
            .post_with_dpop_retry(
                &authserver.pushed_authorization_request_endpoint,
                &form,
                dpop_key,
                nonce_cache,
                &authority,
            )
            .await?;

        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(AppError::Protocol(format!(
                "PAR request failed: HTTP {}",
                resp.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct ParResponse {
            request_uri: String,
        }
        let body: ParResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Protocol(format!("malformed PAR response: {e}")))?;

        Ok(ParOutcome {
            request_uri: body.request_uri,
            state,
            pkce_verifier: pkce.verifier,
            authserver_nonce: nonce_cache.get(&authority),
        })
    }

    pub async fn exchange_code(
        &self,
        authserver: &AuthServerMetadata,
        code: &str,
        verifier: &str,
        dpop_key: &SecretKey,
        nonce_cache: &DpopNonceCache,
    ) -> AppResult<TokenResponse> {
        let mut form = self.auth_params(authserver)?;
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", self.redirect_uri.clone());
        form.insert("code_verifier", verifier.to_string());

        let authority = authority_of(&authserver.issuer)?;
        let resp = self
            .post_with_dpop_retry(&authserver.token_endpoint, &form, dpop_key, nonce_cache, &authority)
            .await?;

        self.parse_token_response(resp).await
    }

    pub async fn refresh_tokens(
        &self,
        authserver: &AuthServerMetadata,
        refresh_token: &str,
        dpop_key: &SecretKey,
        nonce_cache: &DpopNonceCache,
    ) -> AppResult<TokenResponse> {
        let mut form = self.auth_params(authserver)?;
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.to_string());

        let authority = authority_of(&authserver.issuer)?;
        let resp = self
            .post_with_dpop_retry(&authserver.token_endpoint, &form, dpop_key, nonce_cache, &authority)
            .await?;

        self.parse_token_response(resp).await
    }

    pub async fn revoke(
        &self,
        authserver: &AuthServerMetadata,
        token: &str,
        dpop_key: &SecretKey,
        nonce_cache: &DpopNonceCache,
    ) -> AppResult<()> {
        let Some(revocation_endpoint) = authserver.revocation_endpoint.as_ref() else {
            return Ok(());
        };

        let mut form = self.auth_params(authserver)?;
        form.insert("token", token.to_string());

        let authority = authority_of(&authserver.issuer)?;
        let resp = self
            .post_with_dpop_retry(revocation_endpoint, &form, dpop_key, nonce_cache, &authority)
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "token revocation failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn parse_token_response(&self, resp: reqwest::Response) -> AppResult<TokenResponse> {
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Protocol(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }

        let token_response: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Protocol(format!("malformed token response: {e}")))?;

        if token_response.token_type.to_lowercase() != "dpop" {
            return Err(AppError::Protocol(format!(
                "expected DPoP token_type, got {}",
                token_response.token_type
            )));
        }

        Ok(token_response)
    }
}

fn authority_of(url_str: &str) -> AppResult<String> {
    let url = url::Url::parse(url_str).map_err(|e| AppError::Protocol(format!("invalid issuer URL: {e}")))?;
    url.host_str()
        .map(|h| match url.port() {
            Some(p) => format!("{h}:{p}"),
            None => h.to_string(),
        })
        .ok_or_else(|| AppError::Protocol("issuer URL has no host".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_p256_key;

    fn metadata() -> AuthServerMetadata {
        AuthServerMetadata {
            issuer: "https://auth.example".to_string(),
            authorization_endpoint: "https://auth.example/authorize".to_string(),
            token_endpoint: "https://auth.example/token".to_string(),
            pushed_authorization_request_endpoint: "https://auth.example/par".to_string(),
            revocation_endpoint: Some("https://auth.example/revoke".to_string()),
            dpop_signing_alg_values_supported: vec!["ES256".to_string()],
            scopes_supported: vec![],
            token_endpoint_auth_methods_supported: vec!["private_key_jwt".to_string()],
        }
    }

    fn core() -> OAuthClientCore {
        let signing_key = OAuthSigningKey::new("test-kid".to_string(), generate_p256_key());
        OAuthClientCore::new(
            SsrfSafeClient::new(false).unwrap(),
            signing_key,
            "https://client.example/client-metadata.json".to_string(),
            "https://client.example/callback".to_string(),
        )
    }

    #[test]
    fn client_assertion_has_required_claims() {
        let core = core();
        let assertion = core.client_assertion("https://auth.example").unwrap();
        let mut parts = assertion.split('.');
        let _header = parts.next().unwrap();
        let claims_b64 = parts.next().unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&crate::crypto::base64url_decode(claims_b64).unwrap()).unwrap();
        assert_eq!(claims["iss"], core.client_id);
        assert_eq!(claims["sub"], core.client_id);
        assert_eq!(claims["aud"], "https://auth.example");
        assert!(claims["jti"].is_string());
        assert!(claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap() <= 60);
    }

    #[test]
    fn auth_params_selects_private_key_jwt() {
        let core = core();
        let params = core.auth_params(&metadata()).unwrap();
        assert_eq!(
            params.get("client_assertion_type").map(|s| s.as_str()),
            Some(CLIENT_ASSERTION_TYPE_JWT_BEARER)
        );
        assert!(params.contains_key("client_assertion"));
    }

    #[test]
    fn auth_params_falls_back_to_none() {
        let core = core();
        let mut m = metadata();
        m.token_endpoint_auth_methods_supported = vec!["none".to_string()];
        let params = core.auth_params(&m).unwrap();
        assert!(!params.contains_key("client_assertion"));
    }

    #[test]
    fn authority_of_includes_port() {
        assert_eq!(authority_of("https://auth.example:8443/x").unwrap(), "auth.example:8443");
        assert_eq!(authority_of("https://auth.example/x").unwrap(), "auth.example");
    }
}
