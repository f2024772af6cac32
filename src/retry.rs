use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff without jitter.
///
/// The first attempt runs immediately; retry `n` (1-based) waits `base * 2^(n-1)`.
/// `max_retries` bounds the total number of attempts, so an operation that
/// always fails runs exactly `max_retries` times (at least once).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }
}

/// Sleeps between attempts. Swapped out in tests to observe the schedule.
#[async_trait]
pub trait Delay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure: {0}")]
    Fatal(E),
    #[error("cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or the
/// policy runs out of retries.
///
/// Cancellation is only observed while sleeping between attempts; an attempt that
/// has started always runs to completion so its outcome is never misreported.
pub async fn retry<T, E, Op, Fut, R>(
    policy: &RetryPolicy,
    delay: &dyn Delay,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    E: Display,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 1u32;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let wait = policy.delay_for(attempt);
        tracing::warn!(
            error = %err,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = wait.as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "attempt failed; backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt, last: err });
            }
            _ = delay.sleep(wait) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingDelay;
    use std::future;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), max_retries)
    }

    #[test]
    fn delays_double_from_base() {
        let delays: Vec<_> = (1..=4).map(|retry| policy(5).delay_for(retry)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn large_exponents_saturate() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 64);
        assert!(policy.delay_for(64) >= policy.delay_for(40));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let delay = RecordingDelay::default();
        let cancel = CancellationToken::new();
        let mut calls = 0u32;

        let result = retry(&policy(5), &delay, &cancel, |_: &&str| true, |attempt| {
            calls += 1;
            future::ready(if attempt <= 3 { Err("connection reset") } else { Ok(attempt) })
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls, 4);
        let waits = delay.recorded();
        assert_eq!(waits.len(), 3);
        assert!(waits.windows(2).all(|w| w[1] == w[0] * 2));
    }

    #[tokio::test]
    async fn stops_after_max_retries() {
        let delay = RecordingDelay::default();
        let cancel = CancellationToken::new();
        let mut calls = 0u32;

        let result: Result<(), _> = retry(&policy(3), &delay, &cancel, |_: &&str| true, |_| {
            calls += 1;
            future::ready(Err("connection reset"))
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls, 3);
        assert_eq!(
            delay.recorded(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn zero_max_retries_still_runs_once() {
        let delay = RecordingDelay::default();
        let cancel = CancellationToken::new();
        let mut calls = 0u32;

        let result: Result<(), _> = retry(&policy(0), &delay, &cancel, |_: &&str| true, |_| {
            calls += 1;
            future::ready(Err("connection reset"))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls, 1);
        assert!(delay.recorded().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let delay = RecordingDelay::default();
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            retry(&policy(3), &delay, &cancel, |_: &&str| false, |_| future::ready(Err("bad row")))
                .await;

        assert!(matches!(result, Err(RetryError::Fatal("bad row"))));
        assert!(delay.recorded().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = retry(
            &RetryPolicy::new(Duration::from_secs(3600), 3),
            &TokioDelay,
            &cancel,
            |_: &&str| true,
            |_| future::ready(Err("connection reset")),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
