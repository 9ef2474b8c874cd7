//! Bounded retries with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// How many times to retry an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (`0` means a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Double the delay after each retry.
    pub exponential_backoff: bool,
    /// Cap for the doubled delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default backoff cap.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Policy with exponential backoff and the default cap.
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            exponential_backoff: true,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    /// Toggle exponential backoff.
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to use after `current` has been waited.
    pub fn next_delay(&self, current: Duration) -> Duration {
        if !self.exponential_backoff {
            return current;
        }
        current.saturating_mul(2).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Optional callbacks consulted by [`retry_with_backoff`].
pub struct RetryHooks<'a, E> {
    on_retry: Option<&'a (dyn Fn(u32, &E, Duration) + Send + Sync + 'a)>,
    retry_condition: Option<&'a (dyn Fn(&E) -> bool + Send + Sync + 'a)>,
}

impl<E> Default for RetryHooks<'_, E> {
    fn default() -> Self {
        Self {
            on_retry: None,
            retry_condition: None,
        }
    }
}

impl<'a, E> RetryHooks<'a, E> {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called as `(attempt, error, delay)` before each backoff wait.
    pub fn on_retry(mut self, f: &'a (dyn Fn(u32, &E, Duration) + Send + Sync + 'a)) -> Self {
        self.on_retry = Some(f);
        self
    }

    /// Errors for which this returns `false` are not retried.
    pub fn retry_condition(
        mut self,
        f: Option<&'a (dyn Fn(&E) -> bool + Send + Sync + 'a)>,
    ) -> Self {
        self.retry_condition = f;
        self
    }
}

/// Failure of [`retry_with_backoff`], wrapping the error of the last attempt.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed.
    #[error("failed after {attempts} attempt(s): {error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        error: E,
    },
    /// The retry condition rejected the error.
    #[error("non-retryable error after {attempts} attempt(s): {error}")]
    Rejected {
        /// Attempts made.
        attempts: u32,
        /// The rejected error.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// The error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Rejected { error, .. } => error,
        }
    }

    /// Borrow the error of the last attempt.
    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Rejected { error, .. } => error,
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Whether the retry condition stopped the retries.
    pub fn is_rejected(&self) -> bool {
        matches!(self, RetryError::Rejected { .. })
    }
}

/// Run `op` until it succeeds, up to `policy.max_retries + 1` times.
///
/// No jitter is applied to the delays.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    hooks: RetryHooks<'_, E>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;
        let error = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        // Checked before the budget: a rejected last attempt is still `Rejected`.
        if let Some(retry_condition) = hooks.retry_condition {
            if !retry_condition(&error) {
                debug!(attempt, %error, "error rejected by retry condition");
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error,
                });
            }
        }
        if attempt > policy.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                error,
            });
        }

        if let Some(on_retry) = hooks.on_retry {
            on_retry(attempt, &error, delay);
        }
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}
