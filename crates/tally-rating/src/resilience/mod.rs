//! Resilience layer for collaborator calls
//!
//! Every call to the account service, state store, cache and log store goes
//! through a [`Resilience`] guard which combines:
//! - Retry with exponential backoff for transient errors
//! - A circuit breaker that fails fast while the collaborator is down
//!
//! Exhausted retries and open circuits surface as
//! [`TallyError::UpstreamUnavailable`]. Non-transient errors (conflicts,
//! validation, not found) pass through untouched.

mod circuit;
mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use retry::RetryConfig;

use std::future::Future;
use tally_common::{Result, TallyError};
use tracing::{info, warn};

/// Retry and circuit-breaking guard for one collaborator
pub struct Resilience {
    service: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl Resilience {
    pub fn new(service: impl Into<String>, retry: RetryConfig, circuit: CircuitConfig) -> Self {
        let service = service.into();
        Self {
            breaker: CircuitBreaker::new(service.clone(), circuit),
            service,
            retry,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Execute `f`, retrying transient failures
    pub async fn call<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if !self.breaker.allow_request() {
                warn!(service = %self.service, operation, "Circuit open, rejecting call");
                return Err(TallyError::upstream(&self.service, "circuit open"));
            }

            match f().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 0 {
                        info!(
                            service = %self.service,
                            operation,
                            attempt = attempt + 1,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    self.breaker.record_failure();

                    if attempt >= self.retry.max_retries {
                        warn!(
                            service = %self.service,
                            operation,
                            attempt = attempt + 1,
                            error = %err,
                            "Call failed after max retries"
                        );
                        return Err(TallyError::upstream(&self.service, err.to_string()));
                    }

                    let backoff = self.retry.backoff_duration(attempt);
                    warn!(
                        service = %self.service,
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Call failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    // The collaborator answered; the failure is not its health problem
                    self.breaker.record_success();
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn guard(max_retries: u32, failure_threshold: u32) -> Resilience {
        Resilience::new(
            "test",
            RetryConfig {
                max_retries,
                ..RetryConfig::quick()
            },
            CircuitConfig {
                failure_threshold,
                reset_timeout: Duration::from_secs(60),
                half_open_allowed_calls: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let resilience = guard(3, 10);
        let result = resilience.call("op", || async { Ok::<_, TallyError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let resilience = guard(3, 10);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = resilience
            .call("op", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TallyError::Storage("temporary".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_upstream_unavailable() {
        let resilience = guard(2, 10);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = resilience
            .call("op", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TallyError::Network("connection refused".into()))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(TallyError::UpstreamUnavailable { ref service, .. }) if service == "test"
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_passes_through() {
        let resilience = guard(3, 10);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = resilience
            .call("op", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TallyError::ConcurrentRevisionConflict {
                        key: "k".into(),
                        expected: Some(1),
                    })
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(TallyError::ConcurrentRevisionConflict { .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(resilience.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let resilience = guard(0, 2);
        for _ in 0..2 {
            let _: Result<()> = resilience
                .call("op", || async { Err(TallyError::Storage("down".into())) })
                .await;
        }
        assert_eq!(resilience.circuit_state(), CircuitState::Open);

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = resilience
            .call("op", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(TallyError::UpstreamUnavailable { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
