//! Resilience utilities: connection retry, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff for establishing Redis connections
//! - [`RateLimiter`]: token bucket throttling republish and scope triggers
//! - [`Bulkhead`]: semaphore bounding in-flight queue workers
//!
//! Record processing itself never retries in-process; a failed message is
//! left leased and the queue redelivers it.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use replication_worker::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! // Republish at most 1000 records/sec with a burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! // At most 10 workers in flight
//! let bulkhead = Bulkhead::for_workers(10);
//! if let Some(_permit) = bulkhead.try_acquire() {
//!     // dispatch one worker
//! }
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 doubles the delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Fail fast during worker startup so a wrong queue URL surfaces quickly.
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        750ms     1.25s
    /// 3        1.12s     2.37s
    /// ...
    /// 20       30s       ~45s (total)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket configuration: `refill_rate` tokens per second, up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 ops/sec with a burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter (governor).
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Limits how many operations run at once.
///
/// The consumer pool takes one permit per dispatched message; a permit is
/// held by the worker task and released when it finishes, even if the
/// cycle that dispatched it has already moved on.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Bulkhead sized for a consumer pool. At least one slot.
    pub fn for_workers(max_workers: usize) -> Self {
        Self::new(max_workers.max(1))
    }

    /// Take a slot without waiting; `None` when full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_presets() {
        assert_eq!(RetryConfig::startup().max_attempts, 20);
        assert_eq!(RetryConfig::testing().connection_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_never_overflows() {
        let config = RetryConfig::startup();
        assert_eq!(config.delay_for_attempt(5_000), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000,
        });

        limiter.acquire().await;
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "should refill quickly");
    }

    #[test]
    fn test_zero_rate_falls_back_to_one() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_bulkhead_slots() {
        let bulkhead = Bulkhead::for_workers(2);
        assert_eq!(bulkhead.available(), 2);

        let p1 = bulkhead.try_acquire().unwrap();
        let _p2 = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.available(), 0);
        assert_eq!(bulkhead.in_use(), 2);
        assert!(bulkhead.try_acquire().is_none());

        drop(p1);
        assert_eq!(bulkhead.available(), 1);
        assert!(bulkhead.try_acquire().is_some());
    }

    #[test]
    fn test_bulkhead_for_workers_minimum() {
        assert_eq!(Bulkhead::for_workers(0).available(), 1);
    }
}
