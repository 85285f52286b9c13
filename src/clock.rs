//! Monotonic time sources.
//!
//! The time reference ages against a monotonic clock, never against wall time, so a
//! step of the system clock cannot revive or kill a GPS reference. Tests drive the same
//! code with [`ManualClock`].

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub trait MonotonicClock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// Process clock backed by [`Instant`].
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        StdClock { origin: Instant::now() }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for StdClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Synthetic clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        ManualClock { now: Mutex::new(start) }
    }

    pub fn advance(&self, step: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += step;
    }

    pub fn set(&self, value: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(Duration::from_secs(5));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(6500));

        clock.set(Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_std_clock_monotonic() {
        let clock = StdClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
