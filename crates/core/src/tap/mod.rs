use crate::config::TapConfig;
use crate::tempo::{MAX_BPM, MIN_BPM};

/// Turns taps into a tempo estimate from the interval between the last two.
///
/// Only the most recent tap is remembered. A tap arriving after the staleness
/// window starts a new sequence instead of producing an estimate.
#[derive(Debug, Clone)]
pub struct TapEstimator {
    stale_after_ms: f64,
    last_tap_ms: Option<f64>,
}

impl Default for TapEstimator {
    fn default() -> Self {
        Self::new(&TapConfig::default())
    }
}

impl TapEstimator {
    pub fn new(config: &TapConfig) -> Self {
        Self {
            stale_after_ms: config.stale_after_ms,
            last_tap_ms: None,
        }
    }

    /// Records a tap at `now_ms` (milliseconds on a monotonic clock).
    ///
    /// Returns a whole-number BPM when the interval since the previous tap
    /// implies a tempo in `[MIN_BPM, MAX_BPM]`. The timestamp always becomes
    /// the new reference, so a rejected tap still measures the next interval.
    pub fn record_tap(&mut self, now_ms: f64) -> Option<u32> {
        let previous = self.last_tap_ms.replace(now_ms)?;
        let interval = now_ms - previous;

        if interval >= self.stale_after_ms {
            tracing::debug!(interval, "tap sequence went stale, restarting");
            return None;
        }
        if interval <= 0.0 {
            return None;
        }

        let bpm = (60_000.0 / interval).round();
        if bpm >= f64::from(MIN_BPM) && bpm <= f64::from(MAX_BPM) {
            Some(bpm as u32)
        } else {
            tracing::debug!(interval, bpm, "tap interval outside tempo range");
            None
        }
    }

    /// Timestamp of the tap the next interval is measured from, if any.
    pub fn last_tap_ms(&self) -> Option<f64> {
        self.last_tap_ms
    }

    pub fn reset(&mut self) {
        self.last_tap_ms = None;
    }
}
