//! Outbound request throttling shared by concurrent runs.
//!
//! Provider APIs enforce quotas across every run that shares a client, so
//! calls are spaced by a minimum interval and capped in flight. The slot
//! lock is held only long enough to reserve a start time; requests never
//! serialise on each other's completion.

use std::time::Duration;

use tokio::sync::{AcquireError, Mutex, Semaphore, SemaphorePermit};
use tokio::time::{Instant, sleep_until};

/// Spacing and concurrency limiter for provider calls.
#[derive(Debug)]
pub struct Throttle {
    min_spacing: Duration,
    next_slot: Mutex<Instant>,
    in_flight: Semaphore,
}

/// Permit held for the duration of one throttled request.
#[derive(Debug)]
pub struct ThrottlePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Throttle {
    /// Creates a throttle with the given spacing and in-flight cap. A cap of
    /// zero is raised to one.
    #[must_use]
    pub fn new(min_spacing: Duration, max_in_flight: usize) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(Instant::now()),
            in_flight: Semaphore::new(max_in_flight.max(1)),
        }
    }

    /// Returns the configured spacing between request starts.
    #[must_use]
    pub const fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Waits for an in-flight slot and the next free start time.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the throttle has been closed.
    pub async fn acquire(&self) -> Result<ThrottlePermit<'_>, AcquireError> {
        let permit = self.in_flight.acquire().await?;
        let start_at = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_spacing;
            slot
        };
        sleep_until(start_at).await;
        Ok(ThrottlePermit { _permit: permit })
    }
}
