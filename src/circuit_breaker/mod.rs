//! Per-provider circuit breaker guarding federated post resolution.
//!
//! Grounded on `middleware/rate_limit.rs`'s `RwLock<HashMap<...>>` pattern:
//! read-lock to observe state cheaply, upgrade to a write-lock only when a
//! transition is actually needed, and re-check after acquiring it in case
//! another task already performed the transition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ProviderState {
    state: State,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_log: Option<Instant>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_log: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(300),
        }
    }
}

const LOG_DEBOUNCE: Duration = Duration::from_secs(60);

/// Rejection returned when a provider's circuit is open. Carries enough to
/// build a human-readable error without the caller re-deriving it.
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    pub provider: String,
    pub failure_count: u32,
    pub retry_after_secs: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    providers: RwLock<HashMap<String, ProviderState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `Ok(())` if a call to `provider` may proceed, or the open-state
    /// error otherwise. HalfOpen requests are allowed through (a probe).
    pub async fn can_attempt(&self, provider: &str) -> Result<(), CircuitOpenError> {
        {
            let providers = self.providers.read().await;
            if let Some(entry) = providers.get(provider) {
                match entry.state {
                    State::Closed | State::HalfOpen => return Ok(()),
                    State::Open => {
                        let elapsed = entry.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                        if elapsed < self.config.open_duration {
                            let retry_after = self.config.open_duration.saturating_sub(elapsed);
                            return Err(CircuitOpenError {
                                provider: provider.to_string(),
                                failure_count: entry.consecutive_failures,
                                retry_after_secs: retry_after.as_secs().max(1),
                            });
                        }
                        // Stale Open: fall through to upgrade to HalfOpen below.
                    }
                }
            } else {
                return Ok(());
            }
        }

        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();
        if entry.state == State::Open {
            let elapsed = entry.last_failure.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.config.open_duration {
                entry.state = State::HalfOpen;
                self.maybe_log(provider, entry, "half-open: probing after open_duration elapsed");
            } else {
                let retry_after = self.config.open_duration.saturating_sub(elapsed);
                return Err(CircuitOpenError {
                    provider: provider.to_string(),
                    failure_count: entry.consecutive_failures,
                    retry_after_secs: retry_after.as_secs().max(1),
                });
            }
        }
        Ok(())
    }

    pub async fn record_success(&self, provider: &str) {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();
        if entry.state != State::Closed {
            self.maybe_log(provider, entry, "closed: success after half-open probe");
        }
        entry.state = State::Closed;
        entry.consecutive_failures = 0;
        entry.last_failure = None;
    }

    pub async fn record_failure(&self, provider: &str) {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Instant::now());

        match entry.state {
            State::HalfOpen => {
                entry.state = State::Open;
                self.maybe_log(provider, entry, "open: failure during half-open probe");
            }
            State::Closed if entry.consecutive_failures >= self.config.failure_threshold => {
                entry.state = State::Open;
                self.maybe_log(provider, entry, "open: consecutive failure threshold reached");
            }
            _ => {}
        }
    }

    fn maybe_log(&self, provider: &str, entry: &mut ProviderState, message: &str) {
        let now = Instant::now();
        let should_log = entry.last_log.map(|t| now.duration_since(t) >= LOG_DEBOUNCE).unwrap_or(true);
        if should_log {
            tracing::warn!(provider, failures = entry.consecutive_failures, "{}", message);
            entry.last_log = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn starts_closed_and_allows() {
        let cb = CircuitBreaker::new(fast_config());
        assert!(cb.can_attempt("provider-a").await.is_ok());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("provider-a").await;
        }
        assert!(cb.can_attempt("provider-a").await.is_err());
    }

    #[tokio::test]
    async fn half_opens_after_open_duration() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("provider-a").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.can_attempt("provider-a").await.is_ok());
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("provider-a").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.can_attempt("provider-a").await.unwrap();
        cb.record_failure("provider-a").await;
        assert!(cb.can_attempt("provider-a").await.is_err());
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("provider-a").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.can_attempt("provider-a").await.unwrap();
        cb.record_success("provider-a").await;
        cb.record_failure("provider-a").await;
        cb.record_failure("provider-a").await;
        // Only 2 failures after close, below threshold of 3.
        assert!(cb.can_attempt("provider-a").await.is_ok());
    }

    #[tokio::test]
    async fn providers_are_independent() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("provider-a").await;
        }
        assert!(cb.can_attempt("provider-a").await.is_err());
        assert!(cb.can_attempt("provider-b").await.is_ok());
    }
}
