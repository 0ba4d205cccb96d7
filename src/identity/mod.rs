//! Identity Resolver: handle↔DID resolution with bidirectional verification.
//!
//! Grounded on the reference gateway's `AtProtoClient::resolve_handle` /
//! `resolve_pds` pair (directory HTTP calls, PLC vs well-known branching),
//! generalized to a trait so a production deployment always resolves
//! against the real directory/PDS while a development build can fall back
//! to a local PDS `resolveHandle` call — the fallback always logs a
//! warning and is never silently substituted in production.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::http_client::SsrfSafeClient;

/// Sentinel returned when a handle fails the directory round-trip (§3
/// GLOSSARY: "Handle"). Never constructed as a real DID.
pub const HANDLE_INVALID: &str = "handle.invalid";

#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub did: String,
    pub pds_url: String,
}

/// The capability set an Identity Resolver must provide. Split out so the
/// Flow Orchestrator never branches on an environment flag at call sites —
/// it just holds a `dyn IdentityResolver` chosen once at startup.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> AppResult<String>;
    async fn resolve_pds(&self, did: &str) -> AppResult<String>;

    /// Re-resolve `did` and confirm the directory still maps it back to
    /// `expected_handle`. Returns the sentinel on mismatch rather than an
    /// error, so the Flow Orchestrator can decide policy (reject vs. the
    /// documented dev fallback).
    async fn verify_handle(&self, did: &str, expected_handle: &str) -> AppResult<String> {
        let reverse = self.reverse_resolve(did).await?;
        if reverse == expected_handle {
            Ok(reverse)
        } else {
            Ok(HANDLE_INVALID.to_string())
        }
    }

    /// DID → handle, used only by the default `verify_handle` above.
    async fn reverse_resolve(&self, did: &str) -> AppResult<String>;
}

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Deserialize)]
struct DidDocument {
    #[serde(default)]
    #[serde(rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Deserialize)]
struct DidService {
    id: String,
    #[serde(rename = "type")]
    service_type: String,
    #[serde(rename = "serviceEndpoint")]
    service_endpoint: String,
}

impl DidDocument {
    fn pds_endpoint(&self) -> AppResult<String> {
        self.service
            .iter()
            .find(|s| s.id == "#atproto_pds" || s.service_type == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.clone())
            .ok_or_else(|| AppError::Discovery("no atproto PDS service in DID document".to_string()))
    }

    fn handle(&self) -> Option<String> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://").map(|s| s.to_string()))
    }
}

/// Production resolver: `did:plc` against the PLC directory, `did:web`
/// against its `.well-known/did.json`, handle resolution against the
/// bsky-style `resolveHandle` XRPC endpoint. All network calls go through
/// the SSRF-safe client.
pub struct DirectoryIdentityResolver {
    client: SsrfSafeClient,
    plc_directory_url: String,
    bootstrap_resolver_url: String,
}

impl DirectoryIdentityResolver {
    pub fn new(client: SsrfSafeClient, plc_directory_url: String, bootstrap_resolver_url: String) -> Self {
        Self {
            client,
            plc_directory_url,
            bootstrap_resolver_url,
        }
    }

    async fn fetch_did_document(&self, did: &str) -> AppResult<DidDocument> {
        let url = if let Some(_plc) = did.strip_prefix("did:plc:") {
            format!("{}/{}", self.plc_directory_url.trim_end_matches('/'), did)
        } else if let Some(domain_path) = did.strip_prefix("did:web:") {
            let domain = domain_path.replace(':', "/");
            let domain = percent_decode(&domain);
            format!("https://{domain}/.well-known/did.json")
        } else {
            return Err(AppError::Discovery(format!("unsupported DID method: {did}")));
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.client.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(AppError::Discovery(format!(
                "DID document fetch failed for {did}: HTTP {}",
                resp.status()
            )));
        }

        resp.json::<DidDocument>()
            .await
            .map_err(|e| AppError::Discovery(format!("malformed DID document for {did}: {e}")))
    }
}

fn percent_decode(domain_path: &str) -> String {
    domain_path.replace("%3A", ":")
}

#[async_trait]
impl IdentityResolver for DirectoryIdentityResolver {
    async fn resolve_handle(&self, handle: &str) -> AppResult<String> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
            self.bootstrap_resolver_url.trim_end_matches('/'),
            urlencoding_minimal(handle)
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.client.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(AppError::Discovery(format!(
                "handle resolution failed for {handle}: HTTP {}",
                resp.status()
            )));
        }

        let parsed: ResolveHandleResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Discovery(format!("malformed resolveHandle response: {e}")))?;

        if !parsed.did.starts_with("did:") {
            return Err(AppError::Discovery(format!("invalid DID returned: {}", parsed.did)));
        }
        Ok(parsed.did)
    }

    async fn resolve_pds(&self, did: &str) -> AppResult<String> {
        let doc = self.fetch_did_document(did).await?;
        doc.pds_endpoint()
    }

    async fn reverse_resolve(&self, did: &str) -> AppResult<String> {
        let doc = self.fetch_did_document(did).await?;
        Ok(doc.handle().unwrap_or_else(|| HANDLE_INVALID.to_string()))
    }
}

/// Minimal query-component percent-encoding for a handle; handles are
/// domain-like and contain no characters needing more than this.
fn urlencoding_minimal(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

/// Development resolver: delegates to a `DirectoryIdentityResolver` but
/// falls back to a local PDS's `resolveHandle`/describeRepo-style endpoint
/// when the real directory is unreachable. Always logs a warning on
/// fallback; never used unless explicitly constructed in a development
/// profile (see capability selection in config startup).
pub struct DevelopmentIdentityResolver {
    inner: DirectoryIdentityResolver,
    local_pds_url: String,
    client: SsrfSafeClient,
}

impl DevelopmentIdentityResolver {
    pub fn new(inner: DirectoryIdentityResolver, local_pds_url: String, client: SsrfSafeClient) -> Self {
        Self {
            inner,
            local_pds_url,
            client,
        }
    }
}

#[async_trait]
impl IdentityResolver for DevelopmentIdentityResolver {
    async fn resolve_handle(&self, handle: &str) -> AppResult<String> {
        match self.inner.resolve_handle(handle).await {
            Ok(did) => Ok(did),
            Err(e) => {
                tracing::warn!(
                    handle,
                    error = %e,
                    "directory handle resolution failed, falling back to local PDS (development mode)"
                );
                let url = format!(
                    "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
                    self.local_pds_url.trim_end_matches('/'),
                    urlencoding_minimal(handle)
                );
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| self.client.map_send_error(e))?;
                let parsed: ResolveHandleResponse = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Discovery(format!("local PDS resolveHandle malformed: {e}")))?;
                Ok(parsed.did)
            }
        }
    }

    async fn resolve_pds(&self, did: &str) -> AppResult<String> {
        self.inner.resolve_pds(did).await
    }

    async fn reverse_resolve(&self, did: &str) -> AppResult<String> {
        match self.inner.reverse_resolve(did).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::warn!(
                    did,
                    error = %e,
                    "directory reverse resolution failed, development mode treats as unverified"
                );
                Ok(HANDLE_INVALID.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubResolver {
        forward: String,
        reverse: String,
    }

    #[async_trait]
    impl IdentityResolver for StubResolver {
        async fn resolve_handle(&self, _handle: &str) -> AppResult<String> {
            Ok(self.forward.clone())
        }
        async fn resolve_pds(&self, _did: &str) -> AppResult<String> {
            Ok("https://pds.example".to_string())
        }
        async fn reverse_resolve(&self, _did: &str) -> AppResult<String> {
            Ok(self.reverse.clone())
        }
    }

    #[tokio::test]
    async fn verify_handle_matches() {
        let resolver = StubResolver {
            forward: "did:plc:abc".to_string(),
            reverse: "alice.example".to_string(),
        };
        let result = resolver.verify_handle("did:plc:abc", "alice.example").await.unwrap();
        assert_eq!(result, "alice.example");
    }

    #[tokio::test]
    async fn verify_handle_mismatch_yields_sentinel() {
        let resolver = StubResolver {
            forward: "did:plc:abc".to_string(),
            reverse: "someone-else.example".to_string(),
        };
        let result = resolver.verify_handle("did:plc:abc", "alice.example").await.unwrap();
        assert_eq!(result, HANDLE_INVALID);
    }

    #[test]
    fn urlencoding_minimal_preserves_domain_chars() {
        assert_eq!(urlencoding_minimal("alice.example"), "alice.example");
        assert_eq!(urlencoding_minimal("a b"), "a%20b");
    }
}
