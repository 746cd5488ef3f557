//! Backoff shared by REST retries and realtime reconnects.
//!
//! Delays grow exponentially from `initial_backoff`, carry a small bounded
//! jitter, and never exceed `max_backoff`.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Attempt budget and exponential backoff shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    ///
    /// Clamped to `initial_backoff` so consecutive delays never shrink.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Default for REST calls: three retries after the first attempt.
    pub fn rest() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
        }
    }

    /// Default for realtime reconnects.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    /// Same shape with `retries` retries after the first attempt.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.max_attempts = retries.saturating_add(1);
        self
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    ///
    /// Attempt `n` waits roughly `initial_backoff * 2^(n-1)`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .initial_backoff
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        let jitter = jitter_for(self.jitter.min(self.initial_backoff), attempt);
        base.saturating_add(jitter).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::rest()
    }
}

/// Final error of [`retry_async`] with the attempts spent on it.
#[derive(Debug)]
pub struct Attempted<E> {
    pub error: E,
    pub attempts: usize,
    /// True when the error was retryable but the budget ran out.
    pub exhausted: bool,
}

/// Runs `op` until it succeeds, `should_retry` rejects an error, or the
/// policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, Attempted<E>>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !should_retry(&error) {
            return Err(Attempted {
                error,
                attempts: attempt,
                exhausted: false,
            });
        }
        if attempt >= max_attempts {
            return Err(Attempted {
                error,
                attempts: attempt,
                exhausted: true,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_scheduled",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

fn jitter_for(limit: Duration, attempt: usize) -> Duration {
    let limit_nanos = limit.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let seed = clock ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(seed % limit_nanos)
}
