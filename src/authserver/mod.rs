//! Auth-Server Resolver: PDS → protected-resource metadata → authorization
//! server → authorization-server metadata, with validation before any of it
//! is trusted for PAR or token exchange.
//!
//! Grounded on the `discover_authorization_server` chain shown in the
//! AT Protocol OAuth reference files in the pack (PDS
//! `/.well-known/oauth-protected-resource` → first `authorization_servers`
//! entry → `<issuer>/.well-known/oauth-authorization-server`).

use serde::Deserialize;
use url::Url;

use crate::error::{AppError, AppResult};
use crate::http_client::SsrfSafeClient;

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

pub struct AuthServerResolver {
    client: SsrfSafeClient,
    allow_local_dev: bool,
}

impl AuthServerResolver {
    pub fn new(client: SsrfSafeClient, allow_local_dev: bool) -> Self {
        Self {
            client,
            allow_local_dev,
        }
    }

    pub async fn discover(&self, pds_url: &str) -> AppResult<AuthServerMetadata> {
        let protected_resource = self.fetch_protected_resource(pds_url).await?;

        let issuer = protected_resource
            .authorization_servers
            .first()
            .ok_or_else(|| AppError::Discovery("no authorization servers advertised by PDS".to_string()))?;

        let metadata = self.fetch_authserver_metadata(issuer).await?;
        self.validate(&metadata, issuer)?;
        Ok(metadata)
    }

    async fn fetch_protected_resource(&self, pds_url: &str) -> AppResult<ProtectedResourceMetadata> {
        let url = format!("{}/.well-known/oauth-protected-resource", pds_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.client.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(AppError::Discovery(format!(
                "protected resource metadata fetch failed: HTTP {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| AppError::Discovery(format!("malformed protected resource metadata: {e}")))
    }

    async fn fetch_authserver_metadata(&self, issuer: &str) -> AppResult<AuthServerMetadata> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.client.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(AppError::Discovery(format!(
                "authorization server metadata fetch failed: HTTP {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| AppError::Discovery(format!("malformed authorization server metadata: {e}")))
    }

    /// Metadata must be served over HTTPS with no explicit port, unless
    /// `allow_local_dev` is set (the documented localhost escape hatch),
    /// and must advertise PAR, the token endpoint, and DPoP support.
    fn validate(&self, metadata: &AuthServerMetadata, expected_issuer: &str) -> AppResult<()> {
        if metadata.issuer != expected_issuer {
            return Err(AppError::Protocol(format!(
                "authorization server issuer mismatch: expected {expected_issuer}, got {}",
                metadata.issuer
            )));
        }

        for url_str in [
            &metadata.issuer,
            &metadata.authorization_endpoint,
            &metadata.token_endpoint,
            &metadata.pushed_authorization_request_endpoint,
        ] {
            self.validate_endpoint_url(url_str)?;
        }

        if metadata.pushed_authorization_request_endpoint.is_empty() {
            return Err(AppError::Discovery(
                "authorization server does not support pushed authorization requests".to_string(),
            ));
        }

        if !metadata
            .dpop_signing_alg_values_supported
            .is_empty()
            && !metadata
                .dpop_signing_alg_values_supported
                .iter()
                .any(|alg| alg == "ES256")
        {
            return Err(AppError::Discovery(
                "authorization server does not support ES256 DPoP proofs".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_endpoint_url(&self, url_str: &str) -> AppResult<()> {
        let url = Url::parse(url_str)
            .map_err(|e| AppError::Discovery(format!("invalid endpoint URL {url_str}: {e}")))?;

        if url.scheme() != "https" {
            let is_local = url.host_str().map(|h| h == "localhost" || h == "127.0.0.1").unwrap_or(false);
            if !(self.allow_local_dev && is_local && url.scheme() == "http") {
                return Err(AppError::Discovery(format!(
                    "authorization server endpoint must use https: {url_str}"
                )));
            }
        }

        if url.port().is_some() && !self.allow_local_dev {
            return Err(AppError::Discovery(format!(
                "authorization server endpoint must not specify an explicit port: {url_str}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(issuer: &str) -> AuthServerMetadata {
        AuthServerMetadata {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            pushed_authorization_request_endpoint: format!("{issuer}/oauth/par"),
            revocation_endpoint: None,
            dpop_signing_alg_values_supported: vec!["ES256".to_string()],
            scopes_supported: vec![],
            token_endpoint_auth_methods_supported: vec![],
        }
    }

    fn resolver(allow_local_dev: bool) -> AuthServerResolver {
        AuthServerResolver::new(SsrfSafeClient::new(false).unwrap(), allow_local_dev)
    }

    #[test]
    fn validate_accepts_https_metadata() {
        let r = resolver(false);
        let m = metadata("https://auth.example");
        assert!(r.validate(&m, "https://auth.example").is_ok());
    }

    #[test]
    fn validate_rejects_issuer_mismatch() {
        let r = resolver(false);
        let m = metadata("https://auth.example");
        assert!(r.validate(&m, "https://other.example").is_err());
    }

    #[test]
    fn validate_rejects_http_in_production() {
        let r = resolver(false);
        let m = metadata("http://auth.example");
        assert!(r.validate(&m, "http://auth.example").is_err());
    }

    #[test]
    fn validate_rejects_explicit_port_in_production() {
        let r = resolver(false);
        let m = metadata("https://auth.example:8443");
        assert!(r.validate(&m, "https://auth.example:8443").is_err());
    }

    #[test]
    fn validate_allows_local_dev_http_with_port() {
        let r = resolver(true);
        let m = metadata("http://localhost:3000");
        assert!(r.validate(&m, "http://localhost:3000").is_ok());
    }

    #[test]
    fn validate_rejects_non_es256_dpop() {
        let r = resolver(false);
        let mut m = metadata("https://auth.example");
        m.dpop_signing_alg_values_supported = vec!["RS256".to_string()];
        assert!(r.validate(&m, "https://auth.example").is_err());
    }
}
