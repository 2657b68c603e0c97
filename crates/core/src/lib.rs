//! Core library for the Click Track metronome.
//!
//! The heart of the crate is the look-ahead [`Scheduler`]: a coarse, late
//! firing wake-up enqueues clicks slightly ahead of time, each carrying its
//! exact onset, so timing precision comes from the audio backend and not from
//! the wake-up. [`PlaybackSession`] ties the scheduler to [`TempoState`], the
//! [`TapEstimator`] and an [`AudioBackend`], and tells listeners about every
//! beat at the moment it sounds.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod tap;
pub mod tempo;

#[cfg(feature = "audio")]
pub use audio::CpalBackend;
pub use audio::{AudioBackend, CaptureBackend, ClickMixer, LogBackend, PulseTone};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AppConfig, SchedulerConfig, TapConfig, TempoConfig, ToneConfig};
pub use error::{ClickTrackError, Result};
pub use scheduler::{ScheduledPulse, Scheduler};
pub use session::{BeatEvent, Command, PlaybackSession, SessionListener, WeakSession};
pub use tap::TapEstimator;
pub use tempo::TempoState;
