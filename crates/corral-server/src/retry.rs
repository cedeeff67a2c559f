use std::future::Future;
use std::time::Duration;

use log::warn;

/// How a failed transport call is retried before its error surfaces to
/// the caller.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay: Duration,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay: Duration,
        max_delay: Duration,
        factor: u32,
    },
}

impl RetryStrategy {
    /// The pause before retry number `attempt` (1-based), or `None`
    /// once the strategy is exhausted.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        match self {
            Self::Fixed { max_count, delay } => (attempt <= *max_count).then_some(*delay),
            Self::ExponentialBackoff {
                max_count,
                initial_delay,
                max_delay,
                factor,
            } => {
                if attempt > *max_count {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let delay = initial_delay.saturating_mul(factor.saturating_pow(exponent));
                Some(delay.min(*max_delay))
            }
        }
    }
}

#[tonic::async_trait]
pub trait Retryable<F, Fut, T, E> {
    /// Runs the operation until it succeeds or the strategy is
    /// exhausted. `what` names the operation in the retry logs, so a
    /// flaky registration reads differently from a flaky release.
    async fn retry(self, what: &str, strategy: RetryStrategy) -> Result<T, E>;
}

#[tonic::async_trait]
impl<F, Fut, T, E> Retryable<F, Fut, T, E> for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: std::fmt::Display + Send,
{
    async fn retry(mut self, what: &str, strategy: RetryStrategy) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match self().await {
                Ok(x) => return Ok(x),
                Err(e) => {
                    attempt += 1;
                    match strategy.delay(attempt) {
                        Some(delay) => {
                            warn!("{what} failed (attempt {attempt}): {e}; retrying in {delay:?}");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!("{what} failed after {attempt} attempts, giving up: {e}");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_fixed_retry_until_success() {
        let attempts = AtomicUsize::new(0);
        let out = (|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .retry(
            "test operation",
            RetryStrategy::Fixed {
                max_count: 3,
                delay: Duration::from_millis(1),
            },
        )
        .await;
        assert_eq!(out, Ok(2));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_count() {
        let attempts = AtomicUsize::new(0);
        let out: Result<(), &str> = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("always") }
        })
        .retry(
            "test operation",
            RetryStrategy::Fixed {
                max_count: 2,
                delay: Duration::from_millis(1),
            },
        )
        .await;
        assert_eq!(out, Err("always"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fixed_delay_exhausts_after_max_count() {
        let strategy = RetryStrategy::Fixed {
            max_count: 2,
            delay: Duration::from_secs(1),
        };
        assert_eq!(strategy.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(strategy.delay(2), Some(Duration::from_secs(1)));
        assert_eq!(strategy.delay(3), None);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = RetryStrategy::ExponentialBackoff {
            max_count: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 2,
        };
        let delays: Vec<_> = (1..=4).map(|attempt| strategy.delay(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(5)),
            ]
        );
        assert_eq!(strategy.delay(5), None);
    }
}
