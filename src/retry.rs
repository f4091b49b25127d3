//! Retry with backoff for calls to external services.
//!
//! One policy type covers the sandbox, capture, publish and phase retries so
//! attempt ceilings and delays are configured the same way everywhere.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Exponential,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Linear,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Final error of a retried operation, with the number of attempts made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
    /// True when the error was retryable but the ceiling was reached.
    pub exhausted: bool,
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// policy's attempt ceiling is reached. The closure receives the 1-based
/// attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => {
                let retryable = is_retryable(&error);
                if !retryable || attempt >= policy.max_attempts {
                    if retryable {
                        tracing::warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "Retry ceiling reached"
                        );
                    }
                    return Err(RetryError {
                        error,
                        attempts: attempt,
                        exhausted: retryable,
                    });
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying operation with backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
