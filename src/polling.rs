//! Bounded, cancellable polling shared by every waiting phase.
//!
//! Readiness checks and job tracking all reduce to "probe, sleep a fixed
//! interval, give up at a deadline". [`poll_until`] is that loop, written
//! once. Probes are cut off at the deadline and the final sleep is clipped
//! to it, so a loop never runs longer than `timeout + interval`, even when
//! a remote call hangs.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

/// Fixed-interval polling budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between probes.
    pub interval: Duration,
    /// Cumulative budget after which polling gives up.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Result of a single probe.
#[derive(Debug)]
pub enum Probe<T, E> {
    /// The awaited condition holds.
    Ready(T),
    /// Not yet; poll again after the interval.
    Pending,
    /// The condition can never hold; stop immediately.
    Abort(E),
}

/// Raised when a caller cancels an in-progress wait.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Reasons a polling loop ends without the condition holding.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PollError<E> {
    /// The budget elapsed.
    #[error("gave up after {attempts} attempts over {} ms", elapsed.as_millis())]
    TimedOut {
        /// Number of probes issued.
        attempts: u32,
        /// Time spent polling.
        elapsed: Duration,
    },
    /// The cancellation token fired.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// A probe reported a permanent failure.
    #[error("probe aborted: {0}")]
    Aborted(E),
}

/// Repeats `probe` until it is ready, aborts, the policy's budget elapses,
/// or `cancel` fires. The probe receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`PollError`] describing why polling stopped.
pub async fn poll_until<T, E, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Probe<T, E>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        attempts = attempts.saturating_add(1);

        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled.into()),
            outcome = timeout_at(deadline, probe(attempts)) => {
                outcome.unwrap_or(Probe::Pending)
            }
        };

        match outcome {
            Probe::Ready(value) => return Ok(value),
            Probe::Abort(err) => return Err(PollError::Aborted(err)),
            Probe::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                attempts,
                elapsed: now.duration_since(started),
            });
        }

        let pause = policy.interval.min(deadline.duration_since(now));
        tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled.into()),
            () = sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;

    fn policy(interval_ms: u64, timeout_ms: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    #[tokio::test(start_paused = true)]
    async fn ready_on_nth_probe_uses_exactly_n_probes(#[case] ready_on: u32) {
        let calls = AtomicU32::new(0);

        let result: Result<u32, PollError<()>> =
            poll_until(policy(10, 1_000), &CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == ready_on {
                        Probe::Ready(attempt)
                    } else {
                        Probe::Pending
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(ready_on));
        assert_eq!(calls.load(Ordering::SeqCst), ready_on);
    }

    #[rstest]
    #[case(30, 100)]
    #[case(100, 100)]
    #[case(250, 100)]
    #[tokio::test(start_paused = true)]
    async fn never_ready_stops_within_timeout_plus_interval(
        #[case] interval_ms: u64,
        #[case] timeout_ms: u64,
    ) {
        let started = Instant::now();
        let budget = policy(interval_ms, timeout_ms);

        let result: Result<(), PollError<()>> =
            poll_until(budget, &CancellationToken::new(), |_| async { Probe::Pending }).await;

        assert!(matches!(result, Err(PollError::TimedOut { .. })), "{result:?}");
        assert!(started.elapsed() >= budget.timeout);
        assert!(started.elapsed() <= budget.timeout + budget.interval);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_cut_off_at_the_deadline() {
        let started = Instant::now();
        let budget = policy(100, 1_000);

        let result: Result<(), PollError<()>> =
            poll_until(budget, &CancellationToken::new(), |_| async {
                sleep(Duration::from_secs(10)).await;
                Probe::Pending
            })
            .await;

        assert!(
            matches!(result, Err(PollError::TimedOut { attempts: 1, .. })),
            "{result:?}"
        );
        assert!(started.elapsed() <= budget.timeout + budget.interval);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_immediately() {
        let result: Result<(), PollError<&str>> =
            poll_until(policy(10, 1_000), &CancellationToken::new(), |_| async {
                Probe::Abort("instance failed")
            })
            .await;

        assert_eq!(result, Err(PollError::Aborted("instance failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(25)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let result: Result<(), PollError<()>> =
            poll_until(policy(10_000, 60_000), &cancel, |_| async { Probe::Pending }).await;

        assert_eq!(result, Err(PollError::Cancelled(Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_probes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), PollError<()>> = poll_until(policy(1, 10), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Probe::Pending }
        })
        .await;

        assert_eq!(result, Err(PollError::Cancelled(Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
