//! Bounded retry around flaky preconditions.
//!
//! A precondition is an async check answering "is the page ready yet?"
//! (login form present, challenge cleared). The governor calls it up to
//! `max_attempts` times, sleeping a sampled backoff and running an optional
//! recovery action between attempts. Exhaustion produces exactly one
//! classified failure.
//!
//! # Example
//!
//! ```ignore
//! let policy = RetryPolicy::from_config(&config.retry, FailureKind::LoginFormNotFound);
//! let attempts = RetryGovernor::new(&timing)
//!     .with_recovery(&policy, "login form", |_| form_visible(page), || page.reload())
//!     .await?;
//! ```

use std::future::Future;

use tracing::{debug, warn};

use crate::config::{DelayRange, RetryConfig};
use crate::error::{FailureKind, Result, SlotError};
use crate::timing::TimingPolicy;

/// Attempt budget and exhaustion classification for one precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations of the check, at least 1.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub backoff: DelayRange,
    /// Failure raised when every attempt fails.
    pub exhausted: FailureKind,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` of 0 is treated as 1.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: DelayRange, exhausted: FailureKind) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            exhausted,
        }
    }

    /// Policy using the configured attempt budget and backoff.
    #[must_use]
    pub fn from_config(config: &RetryConfig, exhausted: FailureKind) -> Self {
        Self::new(config.max_attempts, config.backoff, exhausted)
    }
}

/// Runs precondition checks under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryGovernor<'a> {
    timing: &'a TimingPolicy,
}

impl<'a> RetryGovernor<'a> {
    /// Governor that sleeps through `timing`.
    #[must_use]
    pub fn new(timing: &'a TimingPolicy) -> Self {
        Self { timing }
    }

    /// Retry `check` without a recovery action.
    pub async fn with_retries<C, CF>(&self, policy: &RetryPolicy, what: &str, check: C) -> Result<u32>
    where
        C: FnMut(u32) -> CF,
        CF: Future<Output = Result<bool>>,
    {
        self.with_recovery(policy, what, check, || std::future::ready(Ok(())))
            .await
    }

    /// Retry `check`, running `recover` before every attempt after the first.
    ///
    /// `check` receives the 1-indexed attempt number. On success the number
    /// of the successful attempt is returned. A check that errors counts as a
    /// failed attempt; if the final attempt failed with a transport error the
    /// exhaustion failure is classified as network instead of
    /// `policy.exhausted`. Recovery failures are logged and ignored.
    pub async fn with_recovery<C, CF, R, RF>(
        &self,
        policy: &RetryPolicy,
        what: &str,
        mut check: C,
        mut recover: R,
    ) -> Result<u32>
    where
        C: FnMut(u32) -> CF,
        CF: Future<Output = Result<bool>>,
        R: FnMut() -> RF,
        RF: Future<Output = Result<()>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error: Option<SlotError> = None;

        for attempt in 1..=max_attempts {
            match check(attempt).await {
                Ok(true) => {
                    debug!("{} ready on attempt {}/{}", what, attempt, max_attempts);
                    return Ok(attempt);
                }
                Ok(false) => {
                    warn!("{} not ready (attempt {}/{})", what, attempt, max_attempts);
                    last_error = None;
                }
                Err(e) => {
                    warn!(
                        "{} check failed (attempt {}/{}): {}",
                        what, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                self.timing.delay(policy.backoff).await;
                if let Err(e) = recover().await {
                    warn!("Recovery before retrying {} failed: {}", what, e);
                }
            }
        }

        Err(exhaustion(policy, what, max_attempts, last_error))
    }
}

fn exhaustion(
    policy: &RetryPolicy,
    what: &str,
    attempts: u32,
    last_error: Option<SlotError>,
) -> SlotError {
    match last_error {
        Some(e) if e.is_network() => SlotError::classified(
            FailureKind::Network,
            format!("{what} unreachable after {attempts} attempts: {e}"),
        ),
        Some(e) => SlotError::classified(
            policy.exhausted,
            format!("{what} not ready after {attempts} attempts: {e}"),
        ),
        None => SlotError::classified(
            policy.exhausted,
            format!("{what} not ready after {attempts} attempts"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::driver::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, DelayRange::fixed(5.0), FailureKind::LoginFormNotFound)
    }

    fn timing() -> TimingPolicy {
        TimingPolicy::seeded(TimingConfig::default(), 11)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let timing = timing();
        let calls = AtomicU32::new(0);

        let attempt = RetryGovernor::new(&timing)
            .with_retries(&policy(3), "login form", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n == 3) }
            })
            .await
            .unwrap();

        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_sleep() {
        let timing = timing();
        let start = tokio::time::Instant::now();

        let attempt = RetryGovernor::new(&timing)
            .with_retries(&policy(3), "x", |_| async { Ok(true) })
            .await
            .unwrap();

        assert_eq!(attempt, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_raises_once_after_max_attempts() {
        let timing = timing();
        let calls = AtomicU32::new(0);
        let recoveries = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let err = RetryGovernor::new(&timing)
            .with_recovery(
                &policy(3),
                "login form",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(false) }
                },
                || {
                    recoveries.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recoveries.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), Some(FailureKind::LoginFormNotFound));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_counts_as_failed_attempt() {
        let timing = timing();
        let calls = AtomicU32::new(0);

        let attempt = RetryGovernor::new(&timing)
            .with_retries(&policy(3), "challenge", |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        Err(SlotError::from(DriverError::Script("detached".into())))
                    } else {
                        Ok(true)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_on_last_attempt_is_network() {
        let timing = timing();

        let err = RetryGovernor::new(&timing)
            .with_retries(&policy(2), "login form", |_| async {
                Err(SlotError::from(DriverError::Network("reset".into())))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(FailureKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_failure_is_ignored() {
        let timing = timing();

        let attempt = RetryGovernor::new(&timing)
            .with_recovery(
                &policy(2),
                "x",
                |n| async move { Ok(n == 2) },
                || async { Err(SlotError::from(DriverError::Closed)) },
            )
            .await
            .unwrap();

        assert_eq!(attempt, 2);
    }

    #[test]
    fn test_zero_attempts_is_one() {
        assert_eq!(policy(0).max_attempts, 1);
    }
}
