// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff, rate limiting and concurrency limits for the pump and publisher.
//!
//! The processor itself never retries. These live one level up:
//!
//! - [`RetryConfig`]: exponential backoff for the pump's per-task retries and
//!   the publisher's connect loop
//! - [`RateLimiter`]: token bucket bounding task throughput
//! - [`Bulkhead`]: semaphore bounding concurrent `process` calls
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), replication_task_processor::resilience::BulkheadClosed> {
//! use replication_task_processor::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // waits while over the limit
//!
//! let bulkhead = Bulkhead::new(10);
//! let _permit = bulkhead.acquire().await?;
//! // process one task; dropping the permit frees the slot
//! # Ok(())
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

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first one included.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential delay.
    pub max_delay: Duration,

    pub backoff_factor: f64,

    /// Bound on a single connection attempt (publisher only).
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Schedule for the publisher's first connection to the broker.
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

    /// Fast-fail schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
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

/// Token bucket settings: `refill_rate` tasks per second sustained, bursts
/// of up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 tasks/sec with bursts of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter. One token per task.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Zero rates are clamped to one.
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
}

// =============================================================================
// Bulkhead
// =============================================================================

/// The bulkhead's semaphore was closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed (max {max_concurrent} concurrent tasks)")]
pub struct BulkheadClosed {
    pub max_concurrent: usize,
}

/// Caps concurrent task processing.
///
/// Permits are owned so they can move into spawned tasks.
#[derive(Debug)]
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

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Slots currently taken.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
