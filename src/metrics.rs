//! Prometheus metrics for the OAuth core.
//!
//! Grounded on the reference gateway's metrics module (lazy_static registry,
//! `CounterVec`/`HistogramVec`/`Gauge`, a `/metrics` text-format handler);
//! the proxy-specific series are dropped since XRPC proxying is out of
//! scope here (see DESIGN.md), replaced with series for the circuit breaker
//! and handle verification.

use lazy_static::lazy_static;
use prometheus::{self, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "coves_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "path"]
    ).unwrap();

    pub static ref OAUTH_LOGINS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_oauth_logins_total", "Total OAuth login attempts"),
        &["status"]
    ).unwrap();

    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_token_refreshes_total", "Total token refresh attempts"),
        &["status"]
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::new(
        "coves_active_sessions",
        "Number of active sessions in the session store"
    ).unwrap();

    pub static ref RATE_LIMIT_EXCEEDED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_rate_limit_exceeded_total", "Total rate limit exceeded events"),
        &["endpoint"]
    ).unwrap();

    pub static ref CIRCUIT_BREAKER_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_circuit_breaker_rejections_total", "Total requests rejected by an open circuit"),
        &["provider"]
    ).unwrap();

    pub static ref HANDLE_VERIFICATION_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("coves_handle_verification_failures_total", "Total bidirectional handle verification failures"),
        &["stage"]
    ).unwrap();
}

/// Register all metrics with the registry
pub fn register_metrics() {
    REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone())).unwrap();
    REGISTRY.register(Box::new(OAUTH_LOGINS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone())).unwrap();
    REGISTRY.register(Box::new(RATE_LIMIT_EXCEEDED_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(CIRCUIT_BREAKER_REJECTIONS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(HANDLE_VERIFICATION_FAILURES_TOTAL.clone())).unwrap();
}

/// Handler for /metrics endpoint - returns Prometheus text format
pub async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record an HTTP request metric
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

/// Record an OAuth login attempt
pub fn record_oauth_login(success: bool) {
    let status = if success { "success" } else { "failure" };
    OAUTH_LOGINS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a token refresh attempt
pub fn record_token_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    TOKEN_REFRESHES_TOTAL.with_label_values(&[status]).inc();
}

/// Update active sessions count
pub fn set_active_sessions(count: f64) {
    ACTIVE_SESSIONS.set(count);
}

/// Record rate limit exceeded event
pub fn record_rate_limit_exceeded(endpoint: &str) {
    RATE_LIMIT_EXCEEDED_TOTAL.with_label_values(&[endpoint]).inc();
}

/// Record a circuit breaker rejection for a federation provider.
pub fn record_circuit_breaker_rejection(provider: &str) {
    CIRCUIT_BREAKER_REJECTIONS_TOTAL.with_label_values(&[provider]).inc();
}

/// Record a bidirectional handle verification failure.
pub fn record_handle_verification_failure(stage: &str) {
    HANDLE_VERIFICATION_FAILURES_TOTAL.with_label_values(&[stage]).inc();
}
