use serde::Serialize;

use crate::config::TempoConfig;

pub const MIN_BPM: u32 = 20;
pub const MAX_BPM: u32 = 240;
pub const MIN_BEATS_PER_BAR: u32 = 1;
pub const MAX_BEATS_PER_BAR: u32 = 12;

/// Tempo and bar position of the metronome.
///
/// All setters clamp into the valid domain instead of rejecting input, so the
/// fields always hold usable values and `current_beat_index < beats_per_bar`.
/// Serializes for reporting only; values always enter through the setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TempoState {
    bpm: u32,
    beats_per_bar: u32,
    current_beat_index: u32,
    is_playing: bool,
    accent_first_beat: bool,
}

impl Default for TempoState {
    fn default() -> Self {
        Self::from_config(&TempoConfig::default())
    }
}

impl TempoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a stopped state from configured initial values, clamping them.
    pub fn from_config(config: &TempoConfig) -> Self {
        let mut state = Self {
            bpm: MIN_BPM,
            beats_per_bar: MIN_BEATS_PER_BAR,
            current_beat_index: 0,
            is_playing: false,
            accent_first_beat: config.accent_first_beat,
        };
        state.set_bpm(f64::from(config.bpm));
        state.set_beats_per_bar(f64::from(config.beats_per_bar));
        state
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    pub fn current_beat_index(&self) -> u32 {
        self.current_beat_index
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn accent_first_beat(&self) -> bool {
        self.accent_first_beat
    }

    /// Seconds between two consecutive beats at the current tempo.
    pub fn beat_interval_secs(&self) -> f64 {
        60.0 / f64::from(self.bpm)
    }

    /// Rounds and clamps `value` into `[MIN_BPM, MAX_BPM]` and returns the
    /// stored tempo. Non-finite input leaves the tempo unchanged.
    pub fn set_bpm(&mut self, value: f64) -> u32 {
        if let Some(bpm) = clamp_rounded(value, MIN_BPM, MAX_BPM) {
            self.bpm = bpm;
        } else {
            tracing::debug!(value, "ignoring non-finite tempo");
        }
        self.bpm
    }

    pub fn adjust_bpm(&mut self, delta: i32) -> u32 {
        self.set_bpm(f64::from(self.bpm) + f64::from(delta))
    }

    /// Rounds and clamps `value` into `[MIN_BEATS_PER_BAR, MAX_BEATS_PER_BAR]`.
    /// The bar position always restarts at beat 0.
    pub fn set_beats_per_bar(&mut self, value: f64) -> u32 {
        if let Some(beats) = clamp_rounded(value, MIN_BEATS_PER_BAR, MAX_BEATS_PER_BAR) {
            self.beats_per_bar = beats;
        } else {
            tracing::debug!(value, "ignoring non-finite beat count");
        }
        self.current_beat_index = 0;
        self.beats_per_bar
    }

    pub fn adjust_beats_per_bar(&mut self, delta: i32) -> u32 {
        self.set_beats_per_bar(f64::from(self.beats_per_bar) + f64::from(delta))
    }

    pub fn set_accent_first_beat(&mut self, enabled: bool) {
        self.accent_first_beat = enabled;
    }

    /// Flips the play flag and returns the new value.
    pub fn toggle_playing(&mut self) -> bool {
        self.set_playing(!self.is_playing);
        self.is_playing
    }

    pub(crate) fn set_playing(&mut self, playing: bool) {
        self.is_playing = playing;
        if !playing {
            self.current_beat_index = 0;
        }
    }

    /// Marks `index` as the beat currently sounding. Out-of-bar indices wrap.
    pub(crate) fn set_current_beat(&mut self, index: u32) {
        self.current_beat_index = index % self.beats_per_bar;
    }

    /// Index that follows `index` within the bar.
    pub fn next_beat_after(&self, index: u32) -> u32 {
        (index + 1) % self.beats_per_bar
    }

    /// Whether a pulse at `beat_index` gets the accent tone right now.
    pub fn is_accented(&self, beat_index: u32) -> bool {
        beat_index == 0 && self.accent_first_beat
    }
}

fn clamp_rounded(value: f64, min: u32, max: u32) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    let clamped = rounded.clamp(f64::from(min), f64::from(max));
    if clamped != rounded {
        tracing::debug!(requested = value, clamped, "value clamped into range");
    }
    Some(clamped as u32)
}
