//! Circuit breaker in front of the system of record, using the recloser crate.
//!
//! While the SoR keeps failing, chunk calls fail fast instead of piling
//! retries onto a provider that is already throttling or down. Items in a
//! rejected chunk surface as `Failed(TRANSPORT)`; operations are idempotent,
//! so the caller can resubmit the request once the provider recovers.
//!
//! ```text
//! Closed ──(failure rate over window)──► Open ──(recovery_timeout)──► HalfOpen
//!    ▲                                                                   │
//!    └──────────────────────(probe calls succeed)────────────────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Open circuit: the call never reached the SoR
    #[error("circuit breaker open, request rejected")]
    Rejected,
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls observed while closed before the failure rate is evaluated
    pub window: u32,
    /// Failure rate (0.0 - 1.0) over the window that trips the circuit
    pub failure_rate: f32,
    /// Probe calls allowed while half-open
    pub probe_calls: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::for_sor()
    }
}

impl CircuitConfig {
    /// Trip when half of the last 20 chunk calls failed; probe after 30s.
    #[must_use]
    pub fn for_sor() -> Self {
        Self {
            window: 20,
            failure_rate: 0.5,
            probe_calls: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Call accounting since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.probe_calls.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the circuit is open. Every `Err` from `f` counts
    /// against the failure rate.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let (outcome, result) = match self.inner.call(f()).await {
            Ok(value) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                ("success", Ok(value))
            }
            Err(RecloserError::Rejected) => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                ("rejected", Err(CircuitError::Rejected))
            }
            Err(RecloserError::Inner(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                ("failure", Err(CircuitError::Inner(e)))
            }
        };
        crate::metrics::record_circuit_call(&self.name, outcome);
        result
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight(recovery: Duration) -> CircuitConfig {
        CircuitConfig { window: 2, failure_rate: 0.5, probe_calls: 1, recovery_timeout: recovery }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Err("502 bad gateway") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_closed_circuit_passes_results_through() {
        let cb = CircuitBreaker::new("sor", CircuitConfig::for_sor());

        assert!(succeed(&cb).await.is_ok());
        assert!(matches!(fail(&cb).await, Err(CircuitError::Inner("502 bad gateway"))));

        assert_eq!(cb.stats(), CircuitStats { calls: 2, successes: 1, failures: 1, rejections: 0 });
    }

    #[tokio::test]
    async fn test_sustained_failures_open_the_circuit() {
        let cb = CircuitBreaker::new("sor", tight(Duration::from_secs(60)));

        for _ in 0..4 {
            let _ = fail(&cb).await;
        }

        assert!(matches!(succeed(&cb).await, Err(CircuitError::Rejected)));
        assert!(cb.stats().rejections >= 1);
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_the_call() {
        let cb = CircuitBreaker::new("sor", tight(Duration::from_secs(60)));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }

        let invoked = AtomicU64::new(0);
        let _: Result<(), CircuitError<&str>> = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_probes_after_recovery_timeout() {
        let cb = CircuitBreaker::new("sor", tight(Duration::from_millis(20)));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(succeed(&cb).await.is_ok());
    }
}
