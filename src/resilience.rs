//! Resilience utilities: failure backoff and the bounded worker pool.
//!
//! - [`RetryConfig`]: exponential backoff for consecutive poll/apply failures
//! - [`Bulkhead`]: semaphore bounding concurrent batch continuation work
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), xcluster_consumer::resilience::BulkheadFull> {
//! use xcluster_consumer::resilience::{Bulkhead, RetryConfig};
//!
//! // Backoff after 4 consecutive failures: 1ms * 2^3 = 8ms
//! let delay = RetryConfig::default().delay_for_attempt(4);
//!
//! // Bulkhead shared by every output client in the process
//! let pool = Bulkhead::for_output_clients();
//! let _permit = pool.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use crate::error::XClusterError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exponential backoff schedule for a failing poller.
///
/// The poller never gives up: `max_attempts` only bounds how far the delay
/// keeps growing before it is pinned at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after which the delay stops growing.
    /// `usize::MAX` means the cap is only `max_delay`.
    pub max_attempts: usize,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Poller schedule: 1ms doubling up to ~65s.
    ///
    /// ```text
    /// Failures  Delay
    /// --------  -----
    /// 1         1ms
    /// 2         2ms
    /// 3         4ms
    /// ...
    /// 17+       65.536s (cap)
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(65_536),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let attempt = attempt.min(self.max_attempts);
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_nanos = self.initial_delay.as_nanos() as f64 * multiplier;
        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }

        Duration::from_nanos(delay_nanos.round() as u64)
    }

    /// Backoff for `consecutive_failures`; zero when nothing failed.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        self.delay_for_attempt(consecutive_failures as usize)
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when the bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

impl From<BulkheadFull> for XClusterError {
    fn from(err: BulkheadFull) -> Self {
        XClusterError::Internal(err.to_string())
    }
}

/// Bounded worker pool shared by output clients.
///
/// Every continuation after an RPC completes (sending the next write,
/// resuming record processing, finalizing a batch) runs while holding a
/// permit, so at most `max_concurrent` batches are being processed at once
/// across the process.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> Result<(), xcluster_consumer::resilience::BulkheadFull> {
/// use xcluster_consumer::resilience::Bulkhead;
/// let bulkhead = Bulkhead::new(10);
///
/// let permit = bulkhead.acquire().await?;
/// // continue_batch().await;
/// drop(permit);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Default pool for output client continuations: 64 slots.
    pub fn for_output_clients() -> Self {
        Self::new(64)
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
