//! Smoothed token bucket.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};
use crate::error::ConstructionError;

/// Seconds of unused capacity a bucket may store for a later burst.
const MAX_BURST_SECONDS: f64 = 1.0;

/// A token bucket that issues permits at a steady rate.
///
/// Idle time accumulates stored permits, up to one second's worth, which are
/// handed out without delay. Once storage runs dry each permit is scheduled
/// one stable interval after the previous one. A request is allowed to "pay
/// ahead": it is granted at the current ticket and pushes the next ticket into
/// the future, so the first request on a fresh bucket never waits.
pub struct TokenBucket {
    /// Permits per second
    rate: f64,
    /// Time between two fresh permits
    stable_interval: Duration,
    /// Upper bound on stored permits
    max_permits: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Unused permits carried over from idle time
    stored_permits: f64,
    /// Earliest instant the next request can be granted
    next_free: Instant,
}

impl TokenBucket {
    /// Create a bucket issuing `rate` permits per second.
    pub fn new(rate: f64) -> Result<Self, ConstructionError> {
        Self::with_clock(rate, Arc::new(SystemClock::new()))
    }

    /// Create a bucket reading time from the given clock.
    pub fn with_clock(rate: f64, clock: Arc<dyn Clock>) -> Result<Self, ConstructionError> {
        let now = clock.now();
        let stable_interval = Self::stable_interval(rate, now)?;

        Ok(Self {
            rate,
            stable_interval,
            max_permits: rate * MAX_BURST_SECONDS,
            clock,
            state: Mutex::new(BucketState {
                stored_permits: 0.0,
                next_free: now,
            }),
        })
    }

    /// Time between fresh permits at `rate`, checked against the clock reading `now`.
    ///
    /// The interval must fit a `Duration` and still be schedulable from `now`.
    pub(crate) fn stable_interval(rate: f64, now: Instant) -> Result<Duration, ConstructionError> {
        if !rate.is_finite() {
            return Err(ConstructionError::InvalidRate {
                rate,
                reason: "rate must be finite",
            });
        }
        if rate <= 0.0 {
            return Err(ConstructionError::InvalidRate {
                rate,
                reason: "rate must be positive",
            });
        }

        Duration::try_from_secs_f64(1.0 / rate)
            .ok()
            .filter(|interval| now.checked_add(*interval).is_some())
            .ok_or(ConstructionError::InvalidRate {
                rate,
                reason: "rate is too small",
            })
    }

    /// Permits per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Reserve one permit if it can be granted within `timeout`.
    ///
    /// Returns how long the caller has to wait before the permit is valid, or
    /// `None` if the permit would not be available in time. A `None` leaves the
    /// bucket untouched, including when the next ticket cannot be represented.
    pub fn reserve(&self, timeout: Duration) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        // An overflowing deadline is as good as waiting forever.
        if let Some(deadline) = now.checked_add(timeout) {
            if state.next_free > deadline {
                return None;
            }
        }

        let (ticket, stored) = if now > state.next_free {
            let idle = now - state.next_free;
            let earned = idle.as_secs_f64() / self.stable_interval.as_secs_f64();
            (now, (state.stored_permits + earned).min(self.max_permits))
        } else {
            (state.next_free, state.stored_permits)
        };

        let spent = stored.min(1.0);
        let fresh = 1.0 - spent;
        let next_free = ticket.checked_add(self.stable_interval.mul_f64(fresh))?;

        state.next_free = next_free;
        state.stored_permits = stored - spent;

        Some(ticket.saturating_duration_since(now))
    }

    /// Acquire one permit, blocking the current thread for at most `timeout`.
    pub fn try_acquire(&self, timeout: Duration) -> bool {
        match self.reserve(timeout) {
            Some(wait) => {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                true
            }
            None => false,
        }
    }

    /// Acquire one permit, suspending the current task for at most `timeout`.
    pub async fn try_acquire_async(&self, timeout: Duration) -> bool {
        match self.reserve(timeout) {
            Some(wait) => {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                true
            }
            None => false,
        }
    }

    /// Stored permits available right now, without reserving any.
    #[cfg(test)]
    fn available_permits(&self) -> f64 {
        let now = self.clock.now();
        let state = self.state.lock();
        if now > state.next_free {
            let idle = now - state.next_free;
            let earned = idle.as_secs_f64() / self.stable_interval.as_secs_f64();
            (state.stored_permits + earned).min(self.max_permits)
        } else {
            state.stored_permits
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("max_permits", &self.max_permits)
            .finish()
    }
}
