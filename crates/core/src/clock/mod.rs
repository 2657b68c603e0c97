use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source measured in seconds.
///
/// Pulse timestamps, wake-up deadlines and beat notifications all use the
/// same clock so that audio and visuals never mix time bases.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock backed by [`Instant`], counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Converts a clock reading back into an [`Instant`] a driver can sleep until.
    pub fn instant_at(&self, seconds: f64) -> Instant {
        self.epoch + Duration::from_secs_f64(seconds.max(0.0))
    }

    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for simulations and deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(seconds: f64) -> Self {
        Self {
            bits: AtomicU64::new(seconds.to_bits()),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    /// Moves the clock forward. Negative deltas are ignored so time stays monotonic.
    pub fn advance(&self, delta: f64) {
        let now = self.now();
        self.set(now + delta.max(0.0));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::new(1.5);
        clock.advance(0.25);
        assert_eq!(clock.now(), 1.75);
        clock.advance(-1.0);
        assert_eq!(clock.now(), 1.75);
    }

    #[test]
    fn monotonic_clock_maps_readings_to_instants() {
        let clock = MonotonicClock::start();
        let reading = clock.now();
        assert!(reading >= 0.0);

        let later = clock.instant_at(reading + 0.5);
        assert!(later > clock.instant_at(reading));
        assert!(clock.elapsed() >= Duration::ZERO);
    }
}
