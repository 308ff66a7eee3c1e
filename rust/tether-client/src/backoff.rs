//! Reconnection backoff: exponential delays with an attempt budget, an
//! optional jitter draw, and a retry predicate that can short-circuit.

use std::fmt;
use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;

/// Backoff schedule configuration.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Base delay for attempt 1.
    pub starting_delay: Duration,
    /// Exponential multiplier between attempts.
    pub time_multiple: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Replace each delay with a uniform draw in `[0, delay]`.
    pub jitter: bool,
    /// Give up after this many attempts, re-throwing the last error.
    pub num_of_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            starting_delay: Duration::from_millis(100),
            time_multiple: 2.0,
            max_delay: Duration::MAX,
            jitter: false,
            num_of_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay before retrying after attempt `n` (1-indexed):
    /// `min(starting_delay · time_multiple^(n-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.time_multiple.powi(attempt.saturating_sub(1) as i32);
        let delay = self.starting_delay.as_secs_f64() * factor;
        let capped = delay.min(self.max_delay.as_secs_f64());
        let drawn = if self.jitter {
            rand::thread_rng().gen_range(0.0..=capped)
        } else {
            capped
        };
        Duration::try_from_secs_f64(drawn).unwrap_or(self.max_delay)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Attempt budget exhausted or the predicate declined; carries the last
    /// error.
    Error(E),
    /// The cancellation context fired.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Error(e) => write!(f, "{e}"),
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Error(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Drive `operation` under the policy. The predicate is consulted after each
/// failure; returning false re-throws immediately, without sleeping. The
/// sleep between attempts aborts when `signal` fires.
pub async fn retry<T, E, F, Fut>(
    policy: &Backoff,
    signal: &CancellationToken,
    mut operation: F,
    mut should_retry: impl FnMut(&E, u32) -> bool,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let budget = policy.num_of_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if signal.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= budget || !should_retry(&error, attempt) {
                    return Err(RetryError::Error(error));
                }
                let delay = policy.delay_for_attempt(attempt);
                tokio::select! {
                    _ = signal.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
