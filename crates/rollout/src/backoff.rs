//! Bounded exponential backoff shared by phase execution and recovery.
//!
//! Two loops are built on the same primitive:
//! - [`Backoff::retry`] re-runs an operation while it fails with a retryable error
//! - [`Backoff::poll`] re-evaluates a predicate until it holds or a deadline passes
//!
//! Neither loop busy-waits and neither can wait without bound.

use crate::context::{CancelToken, Clock};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Multiplier applied per attempt
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub cap: Duration,
    /// Maximum number of attempts for [`Backoff::retry`]
    pub max_attempts: u32,
    /// Overall time budget for [`Backoff::retry`]; `None` means attempts only
    pub deadline: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: 4,
            deadline: None,
        }
    }
}

/// A value produced by [`Backoff::retry`] plus the attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Whether the value only arrived after at least one retry
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Result of a [`Backoff::poll`] loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held
    Satisfied { polls: u32 },
    /// The deadline passed first
    TimedOut { elapsed: Duration },
    /// Cancellation was requested
    Cancelled,
}

impl Backoff {
    /// Create a backoff with custom settings.
    pub fn new(initial: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            initial,
            multiplier,
            cap,
            ..Default::default()
        }
    }

    /// Builder: set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Builder: set the overall deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = delay.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Execute an operation, retrying retryable errors with backoff.
    ///
    /// Non-retryable errors are returned immediately. Cancellation stops the
    /// loop between attempts and returns the last error.
    pub fn retry<T, F>(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<Retried<T>>
    where
        F: FnMut() -> Result<T>,
    {
        let start = clock.now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation() {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
                return Err(err);
            }

            let mut delay = self.delay_for_attempt(attempt - 1);
            if let Some(deadline) = self.deadline {
                let elapsed = clock.now().saturating_duration_since(start);
                if elapsed >= deadline {
                    return Err(err);
                }
                delay = delay.min(deadline - elapsed);
            }

            log::debug!("attempt {attempt}/{max_attempts} failed: {err}; retrying in {delay:?}");

            clock.sleep(delay);
        }
    }

    /// Poll `probe` until it returns `Ok(true)`, `timeout` elapses or the
    /// token is cancelled.
    ///
    /// Probe errors count as "not yet": the remote system is eventually
    /// consistent and a failed observation is retried on the next round.
    /// Sleeps never overshoot the deadline.
    pub fn poll<F>(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
        timeout: Duration,
        mut probe: F,
    ) -> PollOutcome
    where
        F: FnMut() -> Result<bool>,
    {
        let start = clock.now();
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }

            polls += 1;
            match probe() {
                Ok(true) => return PollOutcome::Satisfied { polls },
                Ok(false) => {}
                Err(e) => log::debug!("readiness probe failed (poll {polls}): {e}"),
            }

            let elapsed = clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                return PollOutcome::TimedOut { elapsed };
            }

            let delay = self.delay_for_attempt(polls - 1).min(timeout - elapsed);
            clock.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::error::Error;
    use std::cell::Cell;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(100)).with_max_attempts(3)
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let backoff = Backoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(60));

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(40));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_success_first_try() {
        let clock = ManualClock::new();
        let result = fast()
            .retry(&clock, &CancelToken::new(), || Ok(42))
            .unwrap();
        assert_eq!(result.value, 42);
        assert!(!result.was_retried());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_retry_non_retryable_error() {
        let clock = ManualClock::new();
        let attempts = Cell::new(0);

        let result: Result<Retried<()>> = fast().retry(&clock, &CancelToken::new(), || {
            attempts.set(attempts.get() + 1);
            Err(Error::permanent("forbidden"))
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_retry_eventual_success() {
        let clock = ManualClock::new();
        let attempts = Cell::new(0);

        let result = fast()
            .retry(&clock, &CancelToken::new(), || {
                let current = attempts.get();
                attempts.set(current + 1);
                if current < 2 {
                    Err(Error::transient("connection reset"))
                } else {
                    Ok("applied")
                }
            })
            .unwrap();

        assert_eq!(result.value, "applied");
        assert_eq!(result.attempts, 3);
        assert!(result.was_retried());
        assert_eq!(clock.elapsed(), Duration::from_millis(30));
    }

    #[test]
    fn test_retry_all_attempts_fail() {
        let clock = ManualClock::new();
        let attempts = Cell::new(0);

        let result: Result<Retried<()>> = fast().retry(&clock, &CancelToken::new(), || {
            attempts.set(attempts.get() + 1);
            Err(Error::transient("timeout"))
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_retry_respects_deadline() {
        let clock = ManualClock::new();
        let backoff = Backoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(60))
            .with_max_attempts(100)
            .with_deadline(Duration::from_secs(25));

        let result: Result<Retried<()>> = backoff.retry(&clock, &CancelToken::new(), || {
            Err(Error::transient("throttled"))
        });

        assert!(result.is_err());
        assert!(clock.elapsed() <= Duration::from_secs(25));
    }

    #[test]
    fn test_poll_satisfied() {
        let clock = ManualClock::new();
        let polls = Cell::new(0);
        let outcome = fast().poll(&clock, &CancelToken::new(), Duration::from_secs(5), || {
            polls.set(polls.get() + 1);
            Ok(polls.get() >= 3)
        });
        assert_eq!(outcome, PollOutcome::Satisfied { polls: 3 });
    }

    #[test]
    fn test_poll_times_out_at_deadline() {
        let clock = ManualClock::new();
        let timeout = Duration::from_secs(120);
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(15));

        let outcome = backoff.poll(&clock, &CancelToken::new(), timeout, || Ok(false));

        match outcome {
            PollOutcome::TimedOut { elapsed } => assert_eq!(elapsed, timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(clock.elapsed(), timeout);
    }

    #[test]
    fn test_poll_treats_errors_as_not_ready() {
        let clock = ManualClock::new();
        let polls = Cell::new(0);
        let outcome = fast().poll(&clock, &CancelToken::new(), Duration::from_secs(5), || {
            polls.set(polls.get() + 1);
            if polls.get() == 1 {
                Err(Error::transient("etcd leader changed"))
            } else {
                Ok(true)
            }
        });
        assert_eq!(outcome, PollOutcome::Satisfied { polls: 2 });
    }

    #[test]
    fn test_poll_cancelled() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let outcome = fast().poll(&clock, &cancel, Duration::from_secs(60), || {
            cancel.cancel();
            Ok(false)
        });
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
