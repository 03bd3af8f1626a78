//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::HarnessError;

/// Delay before retry `i` (0-based) is `2^i * base_delay + uniform(0, jitter_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            jitter_max: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before retry `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Upper bound of [`RetryPolicy::delay`] for `attempt`.
    pub fn max_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt).saturating_add(self.jitter_max)
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        // Sampled in nanoseconds so sub-millisecond caps still jitter.
        let jitter_ns = u64::try_from(self.jitter_max.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if jitter_ns == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.gen_range(0..=jitter_ns))
        };
        self.backoff(attempt).saturating_add(jitter)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` calls have been made. `op` receives the 0-based attempt.
///
/// There is no sleep after the final attempt. Exhaustion is reported as
/// [`HarnessError::RetryExhausted`] carrying the last failure.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, HarnessError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HarnessError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= attempts {
            return Err(HarnessError::RetryExhausted {
                attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.delay(attempt - 1, &mut rand::thread_rng());
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying request");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn policy(max_attempts: u32, base_ms: u64, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            jitter_max: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn delay_stays_within_bounds() {
        let p = policy(5, 100, 1000);
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous_floor = Duration::ZERO;
        for attempt in 0..8 {
            let floor = p.backoff(attempt);
            assert!(floor >= previous_floor);
            previous_floor = floor;
            for _ in 0..200 {
                let d = p.delay(attempt, &mut rng);
                assert!(d >= floor);
                assert!(d <= Duration::from_millis(100 * 2u64.pow(attempt) + 1000));
                assert!(d <= p.max_delay(attempt));
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let p = policy(5, 10, 0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(p.delay(0, &mut rng), Duration::from_millis(10));
        assert_eq!(p.delay(2, &mut rng), Duration::from_millis(40));
    }

    #[test]
    fn sub_millisecond_jitter_is_not_truncated() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            jitter_max: Duration::from_micros(500),
        };
        let mut rng = StdRng::seed_from_u64(11);
        let samples: Vec<Duration> = (0..100).map(|_| p.delay(0, &mut rng)).collect();
        assert!(samples.iter().all(|d| *d <= Duration::from_micros(500)));
        assert!(samples.iter().any(|d| *d > Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_without_trailing_sleep() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = retry(&policy(3, 10, 0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HarnessError::Timeout) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(HarnessError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, HarnessError::Timeout));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        // Sleeps before retries 1 and 2 only: 10ms + 20ms.
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(5, 10, 0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HarnessError::Status {
                    status: 400,
                    body: "bad request".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(HarnessError::Status { status: 400, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let result = retry(&policy(5, 10, 0), |attempt| async move {
            if attempt < 2 {
                Err(HarnessError::Status {
                    status: 503,
                    body: String::new(),
                })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
