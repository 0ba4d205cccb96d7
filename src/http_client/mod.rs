//! SSRF-Safe HTTP Client
//!
//! Outbound HTTP with DNS-time IP filtering (not just literal-IP string
//! inspection), a bounded redirect count, and bounded dial/total timeouts.
//! Every auth-server, PDS, and identity-directory fetch in this crate goes
//! through this client rather than a bare `reqwest::Client`.

pub mod ssrf;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;

use crate::error::{AppError, AppResult};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REDIRECTS: usize = 5;

/// A resolved address was private/loopback/link-local and `allow_private`
/// was not set. Carried through `reqwest::Error`'s source chain so callers
/// can recover the rejected host and IP for the error message.
#[derive(Debug)]
pub struct SsrfRejected {
    pub host: String,
    pub ip: SocketAddr,
}

impl std::fmt::Display for SsrfRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "refusing to connect to {} which resolved to private address {}",
            self.host, self.ip
        )
    }
}

impl std::error::Error for SsrfRejected {}

/// Resolves hostnames via the system resolver and rejects the whole
/// resolution if any returned address is private, unless `allow_private`.
struct SsrfFilteringResolver {
    allow_private: bool,
}

impl Resolve for SsrfFilteringResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let allow_private = self.allow_private;
        let host = name.as_str().to_string();
        Box::pin(async move {
            let lookup_target = format!("{host}:0");
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host(lookup_target)
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();

            if !allow_private {
                if let Some(private_addr) = addrs.iter().find(|a| ssrf::is_private_socket_addr(a))
                {
                    return Err(Box::new(SsrfRejected {
                        host,
                        ip: *private_addr,
                    }) as Box<dyn std::error::Error + Send + Sync>);
                }
            }

            let iter: Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

/// An outbound HTTP client with SSRF protection, a bounded redirect chain,
/// and bounded timeouts. Clone is cheap (wraps `reqwest::Client`'s `Arc`).
#[derive(Clone)]
pub struct SsrfSafeClient {
    inner: reqwest::Client,
}

impl SsrfSafeClient {
    /// `allow_private` is the documented dev-only escape hatch — never set
    /// in a production configuration.
    pub fn new(allow_private: bool) -> AppResult<Self> {
        let resolver: Arc<dyn Resolve> = Arc::new(SsrfFilteringResolver { allow_private });

        let inner = reqwest::Client::builder()
            .dns_resolver(resolver)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(DEFAULT_DIAL_TIMEOUT)
            .timeout(DEFAULT_TOTAL_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self { inner })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.inner.get(url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.inner.post(url)
    }

    /// Send a request, translating a resolver-level SSRF rejection buried in
    /// the error source chain into a named `AppError::Ssrf`.
    pub async fn send(&self, request: reqwest::Request) -> AppResult<reqwest::Response> {
        self.inner.execute(request).await.map_err(map_send_error)
    }

    /// Translate a raw `reqwest::Error` (e.g. from a `RequestBuilder::send`
    /// call site that needs the builder's query/header methods) the same
    /// way `send` does.
    pub fn map_send_error(&self, err: reqwest::Error) -> AppError {
        map_send_error(err)
    }
}

fn map_send_error(err: reqwest::Error) -> AppError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(rejected) = e.downcast_ref::<SsrfRejected>() {
            return AppError::Ssrf(rejected.to_string());
        }
        source = e.source();
    }
    if err.is_timeout() {
        AppError::Transient(format!("request timed out: {err}"))
    } else if err.is_redirect() {
        AppError::Ssrf(format!("too many redirects (max {MAX_REDIRECTS}): {err}"))
    } else {
        AppError::Transient(format!("http request failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::ssrf::*;

    #[test]
    fn public_addr_not_rejected_by_classification() {
        let addr: std::net::SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert!(!is_private_socket_addr(&addr));
    }

    #[test]
    fn loopback_addr_rejected_by_classification() {
        let addr: std::net::SocketAddr = "127.0.0.1:443".parse().unwrap();
        assert!(is_private_socket_addr(&addr));
    }
}
