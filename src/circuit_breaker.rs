// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around the publisher.
//!
//! When the replication transport is down, every task would otherwise pay the
//! full publish timeout before failing. The breaker fails those calls fast
//! instead; a rejected publish is a retryable error and the task is not
//! completed.
//!
//! # States
//!
//! - **Closed**: Normal operation, publishes pass through
//! - **Open**: Transport unhealthy, publishes fail fast
//! - **HalfOpen**: Probing whether the transport recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use replication_task_processor::circuit_breaker::{PublisherCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = PublisherCircuit::new();
//!
//! match circuit.publish.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* delivered */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, leave task pending */ }
//!     Err(CircuitError::Inner(e)) => { /* transport error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The call was not attempted because the circuit is open.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the sample window; the circuit trips once a full window is
    /// failing.
    pub failure_threshold: u32,
    /// Trial calls allowed while half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    /// Last call was rejected and nothing has succeeded since.
    open: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            open: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Run `f` unless the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if self.open.swap(false, Ordering::AcqRel) {
                    info!(circuit = %self.name, "Circuit breaker closed");
                }
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                if !self.open.swap(true, Ordering::AcqRel) {
                    warn!(circuit = %self.name, "Circuit breaker open, failing calls fast");
                }
                crate::metrics::record_circuit_rejection(&self.name);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Whether the last decision was a rejection with no success since.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Calls whose operation ran and returned an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Circuit breaker guarding message publication.
///
/// One per pump; the processor holds it behind an `Arc`.
pub struct PublisherCircuit {
    pub publish: CircuitBreaker,
}

impl Default for PublisherCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            publish: CircuitBreaker::new("publisher", config),
        }
    }

    /// Snapshot of the publish counters.
    pub fn metrics(&self) -> PublisherCircuitMetrics {
        PublisherCircuitMetrics {
            total: self.publish.calls_total(),
            successes: self.publish.successes(),
            failures: self.publish.failures(),
            rejections: self.publish.rejections(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.publish.is_open()
    }
}

/// Counters from the publisher circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherCircuitMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::for_testing());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_full_failing_window() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..5 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }

        assert!(cb.failures() >= 2);
        assert!(cb.rejections() >= 1);
        assert_eq!(cb.calls_total(), 5);
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_circuit_closes_after_recovery() {
        let cb = CircuitBreaker::new("test", CircuitConfig::for_testing());

        for _ in 0..3 {
            let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        assert!(cb.is_open());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn test_publisher_circuit_metrics() {
        let circuit = PublisherCircuit::new();

        let _: Result<i32, CircuitError<&str>> = circuit.publish.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> =
            circuit.publish.call(|| async { Err("timeout") }).await;

        let metrics = circuit.metrics();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.rejections, 0);
        assert!(!circuit.is_open());
    }
}
