//! Retry with exponential backoff, as an explicit state machine.
//!
//! [`RetryPolicy`] describes the curve, [`Backoff`] tracks one message's attempts and
//! answers "retry after how long, or give up?". The dispatcher drives a `Backoff` per
//! delivery; the outbox relay uses the policy's delay directly because its attempt
//! count lives in the store.
//!
//! # Example
//!
//! ```rust
//! use eventing_runtime::retry::{Backoff, RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .multiplier(2.0)
//!     .jitter(false)
//!     .build();
//!
//! let mut backoff = Backoff::new(policy);
//! backoff.begin_attempt();
//! assert_eq!(backoff.next_decision(), RetryDecision::RetryAfter(Duration::from_millis(100)));
//! backoff.begin_attempt();
//! assert_eq!(backoff.next_decision(), RetryDecision::RetryAfter(Duration::from_millis(200)));
//! backoff.begin_attempt();
//! assert_eq!(backoff.next_decision(), RetryDecision::Exhausted);
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5 (total attempts, including the first)
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: on
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomise each delay into `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }

    /// Delay to wait after the `failures`-th failed attempt (1-based).
    ///
    /// Uses exponential backoff: `initial_delay * multiplier^(failures - 1)`, capped at
    /// `max_delay`, then jittered if enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let delay = self.base_delay(failures);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0..=delay.as_millis() - half.as_millis());
            #[allow(clippy::cast_possible_truncation)] // Bounded by max_delay
            let spread = Duration::from_millis(spread as u64);
            half + spread
        } else {
            delay
        }
    }

    /// Un-jittered delay after the `failures`-th failed attempt.
    #[must_use]
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)] // Millisecond delays are far below 2^52
        let (initial_ms, max_ms) = (
            self.initial_delay.as_millis() as f64,
            self.max_delay.as_millis() as f64,
        );
        let delay_ms = initial_ms * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Checked above
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts. Values below 1 are treated as 1.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(5).max(1),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter.unwrap_or(true),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    RetryAfter(Duration),
    /// The attempt budget is spent.
    Exhausted,
}

/// Attempt tracker for one unit of work.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start tracking a fresh unit of work (no attempts made yet).
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record the start of an attempt and return its 1-based number.
    pub const fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Attempts started so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Decide what follows a failure of the current attempt.
    ///
    /// A failure reported before any [`Backoff::begin_attempt`] counts as the first
    /// attempt.
    pub fn next_decision(&mut self) -> RetryDecision {
        self.attempt = self.attempt.max(1);
        if self.attempt >= self.policy.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.policy.delay_for_attempt(self.attempt))
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// The operation runs at most `policy.max_attempts` times.
///
/// # Errors
///
/// Returns the last error once every attempt has failed.
///
/// # Example
///
/// ```rust
/// use eventing_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(policy, || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(policy);

    loop {
        let attempt = backoff.begin_attempt();
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => match backoff.next_decision() {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation failed, retrying..."
                    );
                    sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(10))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .jitter(false)
            .build()
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = fixed(10);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(80));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .jitter(false)
            .build();

        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(400))
            .jitter(true)
            .build();

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn backoff_exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(fixed(3));

        assert_eq!(backoff.begin_attempt(), 1);
        assert_eq!(
            backoff.next_decision(),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(backoff.begin_attempt(), 2);
        assert_eq!(
            backoff.next_decision(),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(backoff.begin_attempt(), 3);
        assert_eq!(backoff.next_decision(), RetryDecision::Exhausted);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let mut backoff = Backoff::new(fixed(0));
        assert_eq!(backoff.next_decision(), RetryDecision::Exhausted);
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(fixed(5), || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("Attempt {attempt} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_at_max_attempts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(fixed(3), || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("Persistent failure")
            }
        })
        .await;

        assert_eq!(result, Err("Persistent failure"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
