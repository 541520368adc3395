//! Monotonic time source for every timer in the control path.
//!
//! Production code uses [`MonotonicClock`]; tests inject a [`ManualClock`]
//! and advance it explicitly, so no test ever sleeps.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn elapsed_since(&self, since: Instant) -> Duration {
        self.now().saturating_duration_since(since)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same offset.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Seconds elapsed since `since`, as the f64 the control math works in
pub(crate) fn secs_since(clock: &dyn Clock, since: Instant) -> f64 {
    clock.elapsed_since(since).as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.elapsed_since(start), Duration::ZERO);

        clock.advance_secs(2.5);
        assert_eq!(clock.elapsed_since(start), Duration::from_millis(2500));
    }

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        let start = clock.now();
        handle.advance(Duration::from_secs(10));
        assert_eq!(secs_since(&clock, start), 10.0);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let clock = ManualClock::new();
        let later = clock.now() + Duration::from_secs(5);
        assert_eq!(clock.elapsed_since(later), Duration::ZERO);
    }
}
