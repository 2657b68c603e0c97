use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ClickTrackError, Result};

/// Top-level configuration structure for the application.
///
/// Every section falls back to its defaults, so a partial JSON document such
/// as `{"tempo": {"bpm": 90}}` is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tempo: TempoConfig,
    pub scheduler: SchedulerConfig,
    pub tone: ToneConfig,
    pub tap: TapConfig,
}

impl AppConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.tone.validate()?;
        self.tap.validate()
    }
}

/// Initial tempo settings applied when a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub bpm: u32,
    pub beats_per_bar: u32,
    pub accent_first_beat: bool,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            bpm: 60,
            beats_per_bar: 4,
            accent_first_beat: true,
        }
    }
}

/// Timing of the look-ahead loop.
///
/// `wake_period_ms` must stay well below `lookahead_ms` so a late wake-up
/// never leaves the window unfilled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lookahead_ms: f64,
    pub wake_period_ms: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 100.0,
            wake_period_ms: 25.0,
        }
    }
}

impl SchedulerConfig {
    pub fn lookahead_secs(&self) -> f64 {
        self.lookahead_ms / 1000.0
    }

    pub fn wake_period_secs(&self) -> f64 {
        self.wake_period_ms / 1000.0
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.wake_period_ms.is_finite() && self.wake_period_ms > 0.0) {
            return Err(ClickTrackError::InvalidConfig(format!(
                "wake_period_ms must be positive, got {}",
                self.wake_period_ms
            )));
        }
        if !(self.lookahead_ms.is_finite() && self.lookahead_ms > self.wake_period_ms) {
            return Err(ClickTrackError::InvalidConfig(format!(
                "lookahead_ms ({}) must exceed wake_period_ms ({})",
                self.lookahead_ms, self.wake_period_ms
            )));
        }
        Ok(())
    }
}

/// Shape of the synthesized click for accented and regular beats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub accent_frequency_hz: f32,
    pub regular_frequency_hz: f32,
    pub accent_gain: f32,
    pub regular_gain: f32,
    pub attack_ms: f32,
    pub decay_ms: f32,
    pub duration_ms: f32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            accent_frequency_hz: 1000.0,
            regular_frequency_hz: 800.0,
            accent_gain: 1.0,
            regular_gain: 0.7,
            attack_ms: 1.0,
            decay_ms: 20.0,
            duration_ms: 30.0,
        }
    }
}

impl ToneConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.attack_ms >= 0.0 && self.attack_ms < self.decay_ms) {
            return Err(ClickTrackError::InvalidConfig(format!(
                "attack_ms ({}) must be non-negative and shorter than decay_ms ({})",
                self.attack_ms, self.decay_ms
            )));
        }
        if self.duration_ms < self.decay_ms {
            return Err(ClickTrackError::InvalidConfig(format!(
                "duration_ms ({}) must cover decay_ms ({})",
                self.duration_ms, self.decay_ms
            )));
        }
        if self.accent_frequency_hz <= 0.0 || self.regular_frequency_hz <= 0.0 {
            return Err(ClickTrackError::InvalidConfig(
                "click frequencies must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tap tempo behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Taps further apart than this start a new tap sequence.
    pub stale_after_ms: f64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 3000.0,
        }
    }
}

impl TapConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.stale_after_ms.is_finite() && self.stale_after_ms > 0.0) {
            return Err(ClickTrackError::InvalidConfig(format!(
                "stale_after_ms must be positive, got {}",
                self.stale_after_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let config = AppConfig::from_json_str(r#"{"tempo": {"bpm": 90}}"#).unwrap();

        assert_eq!(config.tempo.bpm, 90);
        assert_eq!(config.tempo.beats_per_bar, 4);
        assert!(config.tempo.accent_first_beat);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn rejects_wake_period_longer_than_lookahead() {
        let err = AppConfig::from_json_str(
            r#"{"scheduler": {"lookahead_ms": 20.0, "wake_period_ms": 25.0}}"#,
        )
        .unwrap_err();

        assert!(matches!(err, ClickTrackError::InvalidConfig(_)));
        assert!(format!("{err}").contains("lookahead_ms"));
    }

    #[test]
    fn rejects_non_positive_tap_window() {
        for text in [
            r#"{"tap": {"stale_after_ms": 0.0}}"#,
            r#"{"tap": {"stale_after_ms": -250.0}}"#,
        ] {
            let err = AppConfig::from_json_str(text).unwrap_err();
            assert!(format!("{err}").contains("stale_after_ms"), "{text}");
        }
        assert!(AppConfig::from_json_str(r#"{"tap": {"stale_after_ms": 1500.0}}"#).is_ok());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = AppConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ClickTrackError::Config(_)));
    }

    #[test]
    fn converts_milliseconds_to_seconds() {
        let scheduler = SchedulerConfig::default();
        assert!((scheduler.lookahead_secs() - 0.1).abs() < 1e-12);
        assert!((scheduler.wake_period_secs() - 0.025).abs() < 1e-12);
    }
}
