use std::cell::RefCell;
use std::f32::consts::PI;
use std::rc::Rc;

use serde::Serialize;

use crate::config::ToneConfig;
use crate::scheduler::ScheduledPulse;
use crate::Result;

#[cfg(feature = "audio")]
mod output;
#[cfg(feature = "audio")]
pub use output::CpalBackend;

/// Level the click decays towards. Exponential ramps cannot reach zero.
const ENVELOPE_FLOOR: f32 = 0.001;
/// Upper bound on overlapping clicks a mixer keeps alive.
pub const MAX_VOICES: usize = 64;

/// A single tone handed to the audio backend with its exact onset time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PulseTone {
    /// Seconds on the session clock.
    pub time: f64,
    pub frequency_hz: f32,
    pub gain: f32,
    pub duration_ms: f32,
}

impl PulseTone {
    /// Picks the accented or regular click for `pulse`.
    pub fn for_pulse(pulse: &ScheduledPulse, tone: &ToneConfig) -> Self {
        let (frequency_hz, gain) = if pulse.is_accented {
            (tone.accent_frequency_hz, tone.accent_gain)
        } else {
            (tone.regular_frequency_hz, tone.regular_gain)
        };
        Self {
            time: pulse.absolute_time,
            frequency_hz,
            gain,
            duration_ms: tone.duration_ms,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        f64::from(self.duration_ms) / 1000.0
    }

    pub fn end_time(&self) -> f64 {
        self.time + self.duration_secs()
    }
}

/// Sink for scheduled clicks.
///
/// Implementations must sound each tone at `tone.time` using their own
/// timing, not the time at which `emit_pulse` was called.
pub trait AudioBackend {
    fn emit_pulse(&mut self, tone: &PulseTone) -> Result<()>;

    /// Drops queued tones whose onset lies after `time`. Tones already
    /// sounding may finish.
    fn cancel_after(&mut self, time: f64) -> Result<()>;
}

/// Amplitude of a click `elapsed` seconds after its onset: a linear attack
/// up to `gain`, then an exponential decay reaching the floor at `decay_ms`.
pub fn envelope_at(shape: &ToneConfig, gain: f32, elapsed: f32) -> f32 {
    if elapsed < 0.0 || elapsed * 1000.0 >= shape.duration_ms || gain <= 0.0 {
        return 0.0;
    }

    let attack = shape.attack_ms / 1000.0;
    if elapsed < attack {
        return gain * elapsed / attack;
    }

    let decay = (shape.decay_ms - shape.attack_ms) / 1000.0;
    let ratio = (ENVELOPE_FLOOR / gain).min(1.0);
    gain * ratio.powf((elapsed - attack) / decay)
}

/// One output sample of `tone`, `elapsed` seconds after it started.
pub fn click_sample(tone: &PulseTone, shape: &ToneConfig, elapsed: f32) -> f32 {
    envelope_at(shape, tone.gain, elapsed) * (2.0 * PI * tone.frequency_hz * elapsed).sin()
}

/// Mixes scheduled clicks into a mono signal addressed by clock time.
#[derive(Debug, Clone)]
pub struct ClickMixer {
    shape: ToneConfig,
    sample_rate: f64,
    voices: Vec<Voice>,
    dropped: u32,
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    tone: PulseTone,
    // When the envelope starts. Later than `tone.time` for clicks that
    // arrived after their slot had already been rendered.
    onset: f64,
}

impl Voice {
    fn end_time(&self) -> f64 {
        self.onset + self.tone.duration_secs()
    }
}

impl ClickMixer {
    pub fn new(shape: ToneConfig, sample_rate: f64) -> Self {
        Self {
            shape,
            sample_rate,
            voices: Vec::with_capacity(MAX_VOICES),
            dropped: 0,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Queues a click whose envelope starts no earlier than `not_before`.
    ///
    /// A click that is already due plays late but whole. Returns `false`
    /// and counts the click as dropped when the voice pool is full.
    pub fn schedule(&mut self, tone: PulseTone, not_before: f64) -> bool {
        if self.voices.len() >= MAX_VOICES {
            self.dropped = self.dropped.saturating_add(1);
            return false;
        }
        self.voices.push(Voice {
            tone,
            onset: tone.time.max(not_before),
        });
        true
    }

    /// Returns and resets the number of clicks refused since the last call.
    pub fn take_dropped(&mut self) -> u32 {
        std::mem::take(&mut self.dropped)
    }

    /// Withdraws clicks scheduled after `time`, judged by their original
    /// pulse time.
    pub fn cancel_after(&mut self, time: f64) {
        self.voices.retain(|voice| voice.tone.time <= time);
    }

    pub fn sample_at(&self, time: f64) -> f32 {
        self.voices
            .iter()
            .map(|voice| click_sample(&voice.tone, &self.shape, (time - voice.onset) as f32))
            .sum::<f32>()
            .clamp(-1.0, 1.0)
    }

    /// Forgets clicks that finished before `time`.
    pub fn retire_before(&mut self, time: f64) {
        self.voices.retain(|voice| voice.end_time() > time);
    }

    /// Renders consecutive frames starting at clock time `start`.
    pub fn render(&mut self, start: f64, out: &mut [f32]) {
        for (frame, sample) in out.iter_mut().enumerate() {
            *sample = self.sample_at(start + frame as f64 / self.sample_rate);
        }
        self.retire_before(start + out.len() as f64 / self.sample_rate);
    }
}

/// Backend that keeps every tone in memory. Clones share the same record,
/// so one copy can be handed to a session while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct CaptureBackend {
    record: Rc<RefCell<CaptureRecord>>,
}

#[derive(Debug, Default)]
struct CaptureRecord {
    emitted: Vec<PulseTone>,
    cancelled: Vec<PulseTone>,
}

impl CaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tones still scheduled, in emission order.
    pub fn tones(&self) -> Vec<PulseTone> {
        self.record.borrow().emitted.clone()
    }

    /// Tones that were withdrawn by `cancel_after`.
    pub fn cancelled(&self) -> Vec<PulseTone> {
        self.record.borrow().cancelled.clone()
    }

    pub fn clear(&self) {
        let mut record = self.record.borrow_mut();
        record.emitted.clear();
        record.cancelled.clear();
    }
}

impl AudioBackend for CaptureBackend {
    fn emit_pulse(&mut self, tone: &PulseTone) -> Result<()> {
        self.record.borrow_mut().emitted.push(*tone);
        Ok(())
    }

    fn cancel_after(&mut self, time: f64) -> Result<()> {
        let mut record = self.record.borrow_mut();
        let emitted = std::mem::take(&mut record.emitted);
        let (kept, dropped): (Vec<PulseTone>, Vec<PulseTone>) =
            emitted.into_iter().partition(|tone| tone.time <= time);
        record.emitted = kept;
        record.cancelled.extend(dropped);
        Ok(())
    }
}

/// Backend that only reports clicks through `tracing`, for running without
/// an output device.
#[derive(Debug, Default)]
pub struct LogBackend {
    emitted: u64,
}

impl LogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl AudioBackend for LogBackend {
    fn emit_pulse(&mut self, tone: &PulseTone) -> Result<()> {
        self.emitted += 1;
        tracing::debug!(
            time = tone.time,
            frequency = tone.frequency_hz,
            gain = tone.gain,
            "click scheduled"
        );
        Ok(())
    }

    fn cancel_after(&mut self, time: f64) -> Result<()> {
        tracing::debug!(time, "pending clicks cancelled");
        Ok(())
    }
}
