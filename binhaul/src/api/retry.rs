//! Retry driver for calls against the source and target services.
//!
//! Transient failures (connection resets, timeouts, 5xx) back off
//! exponentially with optional jitter and try again; semantic rejections
//! abort on the spot. The caller decides which is which per attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Result, TransferError};

/// Exponents beyond this no longer change the delay; the cap takes over
/// long before.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Ceiling applied after doubling and jitter.
    pub max_delay: Duration,
    /// Spread retries of concurrent workers apart by a random fraction of
    /// the base delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number `attempt`
    /// (0-indexed): doubled per attempt, jittered, then capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let mut delay = self.base_delay.saturating_mul(1u32 << exponent);
        if self.jitter {
            let spread_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
            delay += Duration::from_millis(rand::rng().random_range(0..spread_ms));
        }
        delay.min(self.max_delay)
    }
}

/// What a single attempt came to.
pub enum Attempt<T> {
    /// The call went through.
    Done(T),
    /// Transient failure; worth backing off and trying again.
    Again(TransferError),
    /// Permanent failure; retrying would not change the answer.
    Abort(TransferError),
}

/// Drive `operation` until it succeeds, aborts, runs out of retries, or the
/// token is cancelled. The closure receives the attempt number (0-indexed).
pub async fn run_with_retries<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let err = match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(err) => return Err(err),
            Attempt::Again(err) => err,
        };
        if attempt == policy.max_retries {
            return Err(err);
        }

        let delay = policy.backoff_delay(attempt);
        warn!(
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            attempts_left = policy.max_retries - attempt,
            "transient failure, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return Err(TransferError::Cancelled),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn delay_doubles_per_attempt_until_the_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: false,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(2));
        // Exponents far past the cap stay clamped instead of overflowing.
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_half_the_base_and_under_the_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..64 {
            let first = policy.backoff_delay(0);
            assert!(first >= Duration::from_millis(100));
            assert!(first < Duration::from_millis(150));
            assert!(policy.backoff_delay(9) <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn abort_is_not_retried() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<u32> = run_with_retries(&fast_policy(), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Attempt::Abort(TransferError::internal("no")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<u32> = run_with_retries(&fast_policy(), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Attempt::Again(TransferError::internal("flaky")) }
        })
        .await;
        assert!(result.is_err());
        // One initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn recovers_once_the_call_goes_through() {
        let token = CancellationToken::new();
        let result = run_with_retries(&fast_policy(), &token, |attempt| async move {
            match attempt {
                0 => Attempt::Again(TransferError::internal("flaky")),
                _ => Attempt::Done(7u32),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32> =
            run_with_retries(&fast_policy(), &token, |_| async { Attempt::Done(1) }).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
