//! Circuit breakers for replica writes and source reads.
//!
//! When the replica store or the source of truth is failing, every
//! in-flight message would otherwise hammer it until its lease lapses.
//! The breaker fails those calls fast instead; a rejected call surfaces as
//! `RecoverableDelivery`, so the message stays leased and is redelivered
//! once the dependency recovers.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: dependency unhealthy, calls rejected without being attempted
//! - **HalfOpen**: probing recovery with a limited number of calls
//!
//! Only retryable errors count against the breaker. A `PermanentRecord` or
//! `NotFound` says something about the record, not the dependency.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open and the call was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls in the closed-state window; the circuit opens when at least
    /// half of them failed.
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
    /// Trips faster and recovers cautiously. Used for replica writes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures. Used for source reads.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
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

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "rejected");
                metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Run a crate operation through the breaker.
    ///
    /// Retryable errors count as failures; every other error passes through
    /// without touching the breaker. A rejection becomes `RecoverableDelivery`.
    pub async fn guard<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = self
            .call(|| async move {
                match f().await {
                    Ok(value) => Ok(Ok(value)),
                    Err(e) if e.is_retryable() => Err(e),
                    Err(e) => Ok(Err(e)),
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitError::Rejected) => Err(ReplicationError::recoverable(
                operation,
                format!("circuit {} open", self.name),
            )),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Best guess at the state from the counters.
    #[must_use]
    pub fn state_hint(&self) -> CircuitState {
        if self.rejections() > 0 && self.rejections() > self.successes() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

/// Breakers for the two dependencies a replication worker calls per record.
pub struct ReplicationCircuit {
    /// Replica store writes.
    pub writes: CircuitBreaker,
    /// Source-of-truth snapshot reads.
    pub reads: CircuitBreaker,
}

impl Default for ReplicationCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationCircuit {
    pub fn new() -> Self {
        Self {
            writes: CircuitBreaker::new("replica_writes", CircuitConfig::aggressive()),
            reads: CircuitBreaker::new("source_reads", CircuitConfig::lenient()),
        }
    }

    pub fn with_configs(writes_config: CircuitConfig, reads_config: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("replica_writes", writes_config),
            reads: CircuitBreaker::new("source_reads", reads_config),
        }
    }

    /// True when either breaker looks open. Used by health checks.
    pub fn any_open(&self) -> bool {
        self.writes.state_hint() == CircuitState::Open || self.reads.state_hint() == CircuitState::Open
    }
}
