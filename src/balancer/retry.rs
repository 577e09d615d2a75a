//! Retry Logic
//!
//! Automatic retry with jittered exponential backoff for transient failures.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use request_balancer::{RequestFailure, RetryPolicy};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let policy = RetryPolicy::new(2, Duration::from_millis(1000));
//!
//! let result = policy
//!     .run(
//!         || async { Err::<(), _>(RequestFailure::status(503, "unavailable")) },
//!         |_attempt, _failure, _delay| {},
//!     )
//!     .await;
//! assert!(result.is_err());
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::RequestFailure;

/// Lower bound of the jitter factor applied to every backoff delay.
pub const JITTER_MIN: f64 = 0.75;
/// Upper bound of the jitter factor applied to every backoff delay.
pub const JITTER_MAX: f64 = 1.25;

/// Retry policy: how many retries, and the base of the exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Un-jittered delay before retry number `attempt + 1`:
    /// `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }

    /// Run `exec` until it succeeds, fails terminally, or the retry budget
    /// is spent.
    ///
    /// `on_retry(attempt, failure, delay)` fires before each backoff sleep,
    /// with `attempt` counting from zero. Terminal failures are returned
    /// unchanged.
    pub async fn run<F, Fut, T, R>(&self, mut exec: F, mut on_retry: R) -> Result<T, RequestFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestFailure>>,
        R: FnMut(u32, &RequestFailure, Duration),
    {
        let mut attempt: u32 = 0;

        loop {
            match exec().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt, "retry: request succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    if !failure.is_retryable() {
                        debug!(error = %failure, "retry: failure is not retryable");
                        return Err(failure);
                    }
                    if attempt >= self.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            error = %failure,
                            "retry: all attempts exhausted"
                        );
                        return Err(failure);
                    }

                    let delay = with_jitter(self.backoff(attempt));
                    warn!(
                        attempt = attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retry: transient failure, backing off"
                    );
                    on_retry(attempt, &failure, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Scale `duration` by a uniform factor in `[0.75, 1.25]` so callers that
/// failed together do not retry together. Saturates at `Duration::MAX`.
pub fn with_jitter(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
