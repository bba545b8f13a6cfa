//! Retry with bounded exponential backoff and optional jitter.
//!
//! # Example
//!
//! ```no_run
//! use meshline_mesh::resilience::retry::{retry, ExponentialBackoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(5),
//!     multiplier: 2.0,
//!     jitter: true,
//! };
//!
//! let policy = ExponentialBackoff::new(config);
//! let value = retry(&policy, || async { Ok::<_, std::io::Error>(42) }).await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound of any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    None,
    /// Random value between 0 and the computed delay
    #[default]
    Full,
    /// Half the computed delay plus a random half
    Equal,
}

impl JitterStrategy {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            JitterStrategy::None => delay,
            JitterStrategy::Full => delay.mul_f64(rand::random::<f64>()),
            JitterStrategy::Equal => {
                let half = delay / 2;
                half + half.mul_f64(rand::random::<f64>())
            }
        }
    }
}

/// Trait for retry policies
pub trait RetryPolicy: Send + Sync {
    /// Delay to wait after the `failures`-th failed attempt (1-based).
    ///
    /// Returns `None` once the attempt budget is spent.
    fn next_delay(&self, failures: u32) -> Option<Duration>;

    /// Total number of attempts
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    jitter_strategy: JitterStrategy,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        let jitter_strategy = if config.jitter {
            JitterStrategy::Full
        } else {
            JitterStrategy::None
        };

        Self {
            config,
            jitter_strategy,
        }
    }

    pub fn with_jitter(config: RetryConfig, jitter_strategy: JitterStrategy) -> Self {
        Self {
            config,
            jitter_strategy,
        }
    }

    /// Un-jittered delay after the `failures`-th failure.
    fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// Longest total time this policy can spend sleeping between attempts.
    pub fn backoff_bound(&self) -> Duration {
        (1..self.config.max_attempts.max(1))
            .map(|failures| self.base_delay(failures))
            .sum()
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.config.max_attempts {
            return None;
        }
        Some(self.jitter_strategy.apply(self.base_delay(failures)))
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }
}

/// Error wrapper that includes retry attempt information
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error
    pub error: E,
    /// Number of attempts made
    pub attempts: u32,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation failed after {} attempts: {}",
            self.attempts, self.error
        )
    }
}

impl<E: std::error::Error> std::error::Error for RetryError<E> {}

/// Retries `f` under `policy`, treating every error as retryable.
pub async fn retry<F, Fut, T, E, P>(policy: &P, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy + ?Sized,
    E: fmt::Display,
{
    retry_if(policy, f, |_| true).await
}

/// Retries `f` under `policy` while `is_retryable` accepts the error.
pub async fn retry_if<F, Fut, T, E, P, R>(
    policy: &P,
    mut f: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy + ?Sized,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!(attempt = attempts, max_attempts = policy.max_attempts(), "Attempting operation");

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(attempts, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(error = %e, "Error is not retryable, giving up");
                    return Err(RetryError { error: e, attempts });
                }

                match policy.next_delay(attempts) {
                    Some(delay) => {
                        debug!(error = %e, ?delay, "Retrying after delay");
                        sleep(delay).await;
                    }
                    None => {
                        warn!(error = %e, attempts, "Max retry attempts reached");
                        return Err(RetryError { error: e, attempts });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff::new(RetryConfig {
            max_attempts,
            jitter: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry(&no_jitter(5), || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_counts_total_calls() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let err = retry(&no_jitter(3), || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>("permanent error")
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let err = retry_if(
            &no_jitter(5),
            || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err::<(), _>("rejected")
                }
            },
            |e| *e != "rejected",
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_stay_within_backoff_bound() {
        let policy = no_jitter(5);
        let start = tokio::time::Instant::now();

        let _ = retry(&policy, || async { Err::<(), _>("down") }).await;

        // 100 + 200 + 400 + 800 ms
        assert_eq!(policy.backoff_bound(), Duration::from_millis(1500));
        let elapsed = start.elapsed();
        assert!(elapsed >= policy.backoff_bound());
        assert!(elapsed < policy.backoff_bound() + Duration::from_millis(10));
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = no_jitter(5);

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(5), None);
    }

    #[test]
    fn test_exponential_backoff_max_delay() {
        let policy = ExponentialBackoff::new(RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.next_delay(6), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_jitter_never_exceeds_base_delay() {
        let policy = ExponentialBackoff::with_jitter(RetryConfig::default(), JitterStrategy::Equal);

        for _ in 0..20 {
            let delay = policy.next_delay(2).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_retry_error_display() {
        let error = RetryError {
            error: "test error",
            attempts: 3,
        };

        let display = format!("{}", error);
        assert!(display.contains("3 attempts"));
        assert!(display.contains("test error"));
    }
}
