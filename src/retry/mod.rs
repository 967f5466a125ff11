//! Retry policy for transient-failure-prone I/O
//!
//! Provides exponential backoff (base delay, multiplier, capped delay) up to
//! a fixed attempt ceiling. Two standard profiles exist and are picked per
//! call site:
//! - [`RetryPolicy::short`] for low-latency operations such as spool uploads
//! - [`RetryPolicy::long`] for large-object transfers such as bypass copies

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::short()
    }
}

impl RetryPolicy {
    /// Profile for low-latency operations: 500ms doubling up to 10s, 10 attempts.
    pub fn short() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    /// Profile for large transfers: 1s doubling up to 5min, 20 attempts.
    pub fn long() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }

    /// Policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::short()
        }
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = (base_ms * factor).min(self.max_delay.as_millis() as f64) as u64;

        let final_ms = if self.jitter {
            let jitter_range = capped_ms / 4;
            capped_ms.saturating_add(fastrand::u64(0..=jitter_range))
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}

/// Execute an async operation under a retry policy.
///
/// Retries only errors classified as transient by
/// [`ExportError::is_retryable`](crate::error::ExportError::is_retryable).
/// After the last attempt the final error is returned unchanged.
///
/// # Arguments
///
/// * `policy` - Retry policy
/// * `operation_name` - Name of the operation for logging
/// * `operation` - The async operation to execute
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }

                let backoff = policy.backoff_duration(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient error, backing off"
                );
                sleep(backoff).await;
            }
        }
    }
}
