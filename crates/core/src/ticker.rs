//! Memoryless measurement ticker.
//!
//! Inter-tick intervals are drawn from an exponential distribution truncated
//! to [min, max], so the sampling cadence cannot be anticipated by a peer and
//! does not alias with network periodicities. The ticker is polled
//! non-blockingly from the stream hot loops: a tick is observed on the first
//! check after its deadline passes, then the ticker re-arms.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::proto::{AVG_MEASURE_INTERVAL, MAX_MEASURE_INTERVAL, MIN_MEASURE_INTERVAL};

pub(crate) struct MemorylessTicker {
    min: Duration,
    mean: Duration,
    max: Duration,
    next: Instant,
}

impl MemorylessTicker {
    pub(crate) fn new() -> Self {
        Self::with_bounds(
            MIN_MEASURE_INTERVAL,
            AVG_MEASURE_INTERVAL,
            MAX_MEASURE_INTERVAL,
        )
    }

    pub(crate) fn with_bounds(min: Duration, mean: Duration, max: Duration) -> Self {
        let mut ticker = MemorylessTicker {
            min,
            mean,
            max,
            next: Instant::now(),
        };
        ticker.arm();
        ticker
    }

    /// True once per interval: reports whether the current deadline has
    /// passed and, if so, re-arms with a fresh draw.
    pub(crate) fn fire(&mut self) -> bool {
        if Instant::now() < self.next {
            return false;
        }
        self.arm();
        true
    }

    fn arm(&mut self) {
        self.next = Instant::now() + self.draw();
    }

    fn draw(&self) -> Duration {
        let u: f64 = rand::thread_rng().gen();
        if u <= f64::EPSILON {
            return self.max;
        }
        let secs = (-self.mean.as_secs_f64() * u.ln())
            .clamp(self.min.as_secs_f64(), self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_stay_within_bounds() {
        let ticker = MemorylessTicker::new();
        for _ in 0..10_000 {
            let interval = ticker.draw();
            assert!(interval >= MIN_MEASURE_INTERVAL);
            assert!(interval <= MAX_MEASURE_INTERVAL);
        }
    }

    #[test]
    fn does_not_fire_before_min_interval() {
        let mut ticker = MemorylessTicker::new();
        assert!(!ticker.fire());
    }

    #[test]
    fn fires_after_deadline() {
        let mut ticker = MemorylessTicker::with_bounds(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(2),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(ticker.fire());
        // Re-armed: an immediate second check must not fire again.
        assert!(!ticker.fire());
    }
}
