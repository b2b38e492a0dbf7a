//! Retry logic with exponential backoff and error classification.
//!
//! Handles retry strategy, error classification (client/server/network/rate limited),
//! and backoff calculation. `RetryExecutor` composes the strategy around one remote call.

use crate::deadline::Deadline;
use crate::error::{IngestError, IngestResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Error classification for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Client errors (400-499), malformed responses, auth - don't retry
    Client,
    /// Server errors (500-599) - temporary issues, retry with backoff
    Server,
    /// Network errors - timeouts and connection resets, retry with backoff
    Network,
    /// 429 - retry, honoring the server's hint when present
    RateLimited,
}

impl ErrorType {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorType::RateLimited,
            // Request Timeout behaves like a network timeout
            408 => ErrorType::Network,
            500..=599 => ErrorType::Server,
            _ => ErrorType::Client,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorType::Client)
    }
}

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Check if another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32, error_type: ErrorType) -> bool {
        // Never retry client errors
        if !error_type.is_retryable() {
            return false;
        }

        attempt < self.max_attempts
    }

    /// Calculate exponential backoff delay after the given (1-based) attempt
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        // base * 2^(attempt - 1), capped at max_delay
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        // Equal jitter: keep half the delay, randomize the rest
        let half = delay / 2;
        let spread = delay - half;
        half + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }

    /// Delay before the next attempt, preferring the server's hint on 429.
    /// Never longer than `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &IngestError) -> Duration {
        match error {
            IngestError::RateLimited {
                retry_after: Some(hint),
            } => (*hint).min(self.max_delay),
            _ => self.calculate_backoff(attempt),
        }
    }
}

/// Runs one remote operation under a retry strategy
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Run `call` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// Fatal errors are returned unchanged. Exhausting the budget returns
    /// `OperationFailed` wrapping the last error.
    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> IngestResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = IngestResult<T>>,
    {
        self.run_until(operation, &Deadline::unbounded(), call).await
    }

    /// Like `run`, but no attempt starts once `deadline` has stopped.
    ///
    /// A backoff interrupted by the deadline returns `OperationFailed` wrapping
    /// the last error.
    pub async fn run_until<T, F, Fut>(
        &self,
        operation: &str,
        deadline: &Deadline,
        mut call: F,
    ) -> IngestResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = IngestResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let error_type = error.error_type();
            if !error_type.is_retryable() {
                debug!(operation, attempt, error = %error, "Non-retryable failure");
                return Err(error);
            }

            if !self.strategy.should_retry(attempt, error_type) {
                warn!(operation, attempts = attempt, error = %error, "✗ Retry budget exhausted");
                return Err(IngestError::OperationFailed {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.strategy.delay_for(attempt, &error);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "⚠ Retrying after transient failure"
            );
            tokio::select! {
                biased;
                reason = deadline.stopped() => {
                    warn!(operation, attempts = attempt, ?reason, "✗ Retry abandoned at deadline");
                    return Err(IngestError::OperationFailed {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
