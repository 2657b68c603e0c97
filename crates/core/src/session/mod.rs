use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::audio::{AudioBackend, PulseTone};
use crate::clock::Clock;
use crate::config::{AppConfig, ToneConfig};
use crate::scheduler::{ScheduledPulse, Scheduler};
use crate::tap::TapEstimator;
use crate::tempo::TempoState;
use crate::{ClickTrackError, Result};

/// Lazily invoked on the first `start` to open the audio backend.
pub type BackendFactory = Box<dyn FnMut() -> Result<Box<dyn AudioBackend>>>;

/// Beat notification, delivered once the clock reaches the pulse time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatEvent {
    pub beat_index: u32,
    pub is_accented: bool,
    /// The pulse time the click was scheduled for.
    pub time: f64,
}

impl From<&ScheduledPulse> for BeatEvent {
    fn from(pulse: &ScheduledPulse) -> Self {
        Self {
            beat_index: pulse.beat_index,
            is_accented: pulse.is_accented,
            time: pulse.absolute_time,
        }
    }
}

/// Observer of a [`PlaybackSession`]. All methods default to doing nothing.
///
/// Listeners run with no session borrow held, so they may issue commands
/// (including `stop`) on the session that called them.
pub trait SessionListener {
    fn on_beat(&self, _beat: &BeatEvent) {}
    fn on_tempo_changed(&self, _bpm: u32) {}
    fn on_beats_per_bar_changed(&self, _beats_per_bar: u32) {}
    fn on_play_state_changed(&self, _is_playing: bool) {}
    fn on_backend_error(&self, _message: &str) {}
}

/// Commands a presentation layer can forward to the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Toggle,
    SetBpm(f64),
    AdjustBpm(i32),
    SetBeatsPerBar(f64),
    AdjustBeatsPerBar(i32),
    /// Tap timestamp in milliseconds on a monotonic clock.
    Tap(f64),
    SetAccentFirst(bool),
}

enum Notification {
    Tempo(u32),
    BeatsPerBar(u32),
    PlayState(bool),
    BackendError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    CurrentBeat,
    BarStart,
}

/// A single metronome: tempo state, tap estimator and the look-ahead loop
/// bound to one audio backend.
///
/// The session is single threaded and cheap to clone; clones share state.
/// Something must drive it: sleep until [`next_deadline`](Self::next_deadline)
/// (late is fine, early is wasted) and call [`poll`](Self::poll).
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Rc<Shared>,
}

/// Non-owning handle, for listeners that need to command their session.
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

struct Shared {
    clock: Arc<dyn Clock>,
    state: RefCell<SessionState>,
    listeners: RefCell<Vec<Rc<dyn SessionListener>>>,
}

struct SessionState {
    tempo: TempoState,
    tap: TapEstimator,
    scheduler: Scheduler,
    tone: ToneConfig,
    factory: BackendFactory,
    backend: Option<Box<dyn AudioBackend>>,
    // Handed to the backend, beat notification not yet delivered.
    pending: VecDeque<ScheduledPulse>,
    last_sounded: Option<f64>,
}

impl PlaybackSession {
    /// Creates a stopped session. `factory` runs on the first successful
    /// `start` and its backend is reused for every later start.
    pub fn new<F>(config: &AppConfig, clock: Arc<dyn Clock>, factory: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn AudioBackend>> + 'static,
    {
        let state = SessionState {
            tempo: TempoState::from_config(&config.tempo),
            tap: TapEstimator::new(&config.tap),
            scheduler: Scheduler::new(&config.scheduler),
            tone: config.tone,
            factory: Box::new(factory),
            backend: None,
            pending: VecDeque::new(),
            last_sounded: None,
        };
        Self {
            shared: Rc::new(Shared {
                clock,
                state: RefCell::new(state),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates a session around an already constructed backend.
    pub fn with_backend<B>(config: &AppConfig, clock: Arc<dyn Clock>, backend: B) -> Self
    where
        B: AudioBackend + 'static,
    {
        let mut slot = Some(backend);
        Self::new(config, clock, move || {
            slot.take()
                .map(|backend| Box::new(backend) as Box<dyn AudioBackend>)
                .ok_or_else(|| ClickTrackError::backend_unavailable("backend was already taken"))
        })
    }

    pub fn subscribe(&self, listener: Rc<dyn SessionListener>) {
        self.shared.listeners.borrow_mut().push(listener);
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn now(&self) -> f64 {
        self.shared.clock.now()
    }

    /// Copy of the current tempo and bar position.
    pub fn snapshot(&self) -> Result<TempoState> {
        Ok(self.state()?.tempo.clone())
    }

    pub fn is_playing(&self) -> Result<bool> {
        Ok(self.state()?.tempo.is_playing())
    }

    /// Starts playback from beat 0. A second `start` is a no-op.
    ///
    /// Fails with [`ClickTrackError::BackendUnavailable`] if the backend
    /// cannot be opened, leaving the session stopped and unchanged.
    pub fn start(&self) -> Result<()> {
        let mut notifications = Vec::new();
        {
            let mut state = self.state()?;
            if state.tempo.is_playing() {
                tracing::debug!("start ignored, already playing");
                return Ok(());
            }
            state.ensure_backend()?;

            let now = self.now();
            let beat_index = state.tempo.current_beat_index();
            state.last_sounded = None;
            state.tempo.set_playing(true);
            state.scheduler.start(now, beat_index);
            state.look_ahead(now, &mut notifications);
            tracing::info!(
                bpm = state.tempo.bpm(),
                beats = state.tempo.beats_per_bar(),
                "playback started"
            );
            notifications.push(Notification::PlayState(true));
        }
        self.notify(notifications);
        Ok(())
    }

    /// Stops playback. Nothing is enqueued and no beat is delivered after
    /// this returns; clicks the backend already holds for later are
    /// withdrawn. A `stop` while stopped is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut notifications = Vec::new();
        {
            let mut state = self.state()?;
            if !state.tempo.is_playing() {
                tracing::debug!("stop ignored, not playing");
                return Ok(());
            }

            let now = self.now();
            state.scheduler.stop();
            state.pending.clear();
            state.last_sounded = None;
            state.cancel_backend(now, &mut notifications);
            state.tempo.set_playing(false);
            tracing::info!("playback stopped");
            notifications.push(Notification::PlayState(false));
        }
        self.notify(notifications);
        Ok(())
    }

    /// Starts when stopped, stops when playing. Returns the new play state.
    pub fn toggle(&self) -> Result<bool> {
        if self.is_playing()? {
            self.stop()?;
            Ok(false)
        } else {
            self.start()?;
            Ok(true)
        }
    }

    pub fn set_bpm(&self, value: f64) -> Result<u32> {
        self.change_tempo(|tempo| tempo.set_bpm(value))
    }

    pub fn adjust_bpm(&self, delta: i32) -> Result<u32> {
        self.change_tempo(|tempo| tempo.adjust_bpm(delta))
    }

    pub fn set_beats_per_bar(&self, value: f64) -> Result<u32> {
        self.change_bar(|tempo| tempo.set_beats_per_bar(value))
    }

    pub fn adjust_beats_per_bar(&self, delta: i32) -> Result<u32> {
        self.change_bar(|tempo| tempo.adjust_beats_per_bar(delta))
    }

    /// Applies the accent setting to pulses computed from now on.
    pub fn set_accent_first(&self, enabled: bool) -> Result<()> {
        self.state()?.tempo.set_accent_first_beat(enabled);
        Ok(())
    }

    /// Feeds a tap (milliseconds, monotonic) to the estimator and adopts the
    /// resulting tempo, if any.
    pub fn record_tap(&self, now_ms: f64) -> Result<Option<u32>> {
        let estimate = self.state()?.tap.record_tap(now_ms);
        match estimate {
            Some(bpm) => {
                tracing::debug!(bpm, "tap tempo estimate");
                self.set_bpm(f64::from(bpm)).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn apply(&self, command: Command) -> Result<()> {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Toggle => self.toggle().map(drop),
            Command::SetBpm(value) => self.set_bpm(value).map(drop),
            Command::AdjustBpm(delta) => self.adjust_bpm(delta).map(drop),
            Command::SetBeatsPerBar(value) => self.set_beats_per_bar(value).map(drop),
            Command::AdjustBeatsPerBar(delta) => self.adjust_beats_per_bar(delta).map(drop),
            Command::Tap(now_ms) => self.record_tap(now_ms).map(drop),
            Command::SetAccentFirst(enabled) => self.set_accent_first(enabled),
        }
    }

    /// Earliest clock time at which [`poll`](Self::poll) has work: the next
    /// look-ahead wake-up or the next beat notification. `None` while stopped.
    pub fn next_deadline(&self) -> Result<Option<f64>> {
        let state = self.state()?;
        if !state.tempo.is_playing() {
            return Ok(None);
        }
        let wake = state.scheduler.next_wake();
        let beat = state.pending.front().map(|pulse| pulse.absolute_time);
        Ok(match (wake, beat) {
            (Some(wake), Some(beat)) => Some(wake.min(beat)),
            (wake, beat) => wake.or(beat),
        })
    }

    /// Runs a look-ahead pass if the wake-up is due, then delivers every beat
    /// whose time has come. Returns the number of beats delivered.
    pub fn poll(&self) -> Result<usize> {
        let now = self.now();
        let mut notifications = Vec::new();
        {
            let mut state = self.state()?;
            if state.tempo.is_playing() && state.scheduler.is_wake_due(now) {
                state.look_ahead(now, &mut notifications);
            }
        }
        self.notify(notifications);

        let mut delivered = 0;
        loop {
            // Released before the listeners run, so they may command the session.
            let beat = self.state()?.take_due_beat(now);
            let Some(beat) = beat else {
                break;
            };
            delivered += 1;
            for listener in self.listeners() {
                listener.on_beat(&beat);
            }
        }
        Ok(delivered)
    }

    fn change_tempo(&self, update: impl FnOnce(&mut TempoState) -> u32) -> Result<u32> {
        let mut notifications = Vec::new();
        let bpm = {
            let mut state = self.state()?;
            let previous = state.tempo.bpm();
            let bpm = update(&mut state.tempo);
            if bpm != previous {
                tracing::info!(bpm, previous, "tempo changed");
                if state.tempo.is_playing() {
                    state.restart(self.now(), Resume::CurrentBeat, &mut notifications);
                }
            }
            notifications.push(Notification::Tempo(bpm));
            bpm
        };
        self.notify(notifications);
        Ok(bpm)
    }

    fn change_bar(&self, update: impl FnOnce(&mut TempoState) -> u32) -> Result<u32> {
        let mut notifications = Vec::new();
        let beats = {
            let mut state = self.state()?;
            let beats = update(&mut state.tempo);
            tracing::info!(beats, "beats per bar changed");
            if state.tempo.is_playing() {
                state.restart(self.now(), Resume::BarStart, &mut notifications);
            }
            notifications.push(Notification::BeatsPerBar(beats));
            beats
        };
        self.notify(notifications);
        Ok(beats)
    }

    fn state(&self) -> Result<RefMut<'_, SessionState>> {
        self.shared
            .state
            .try_borrow_mut()
            .map_err(|_| ClickTrackError::msg("playback session is already borrowed"))
    }

    fn listeners(&self) -> Vec<Rc<dyn SessionListener>> {
        self.shared.listeners.borrow().clone()
    }

    fn notify(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let listeners = self.listeners();
        for notification in &notifications {
            for listener in &listeners {
                match notification {
                    Notification::Tempo(bpm) => listener.on_tempo_changed(*bpm),
                    Notification::BeatsPerBar(beats) => listener.on_beats_per_bar_changed(*beats),
                    Notification::PlayState(playing) => listener.on_play_state_changed(*playing),
                    Notification::BackendError(message) => listener.on_backend_error(message),
                }
            }
        }
    }
}

impl fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PlaybackSession");
        match self.shared.state.try_borrow() {
            Ok(state) => debug
                .field("tempo", &state.tempo)
                .field("pending", &state.pending.len())
                .field("backend_open", &state.backend.is_some()),
            Err(_) => debug.field("state", &"<borrowed>"),
        };
        debug.finish()
    }
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<PlaybackSession> {
        self.shared.upgrade().map(|shared| PlaybackSession { shared })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSession")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl SessionState {
    fn ensure_backend(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend = (self.factory)().map_err(|err| match err {
            ClickTrackError::BackendUnavailable(_) => err,
            other => ClickTrackError::BackendUnavailable(other.to_string()),
        });
        match backend {
            Ok(backend) => {
                tracing::info!("audio backend opened");
                self.backend = Some(backend);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "cannot start playback");
                Err(err)
            }
        }
    }

    // Hands every pulse inside the window to the backend and queues its beat.
    fn look_ahead(&mut self, now: f64, notifications: &mut Vec<Notification>) {
        let pulses = self.scheduler.fill(now, &self.tempo);
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        for pulse in pulses {
            let tone = PulseTone::for_pulse(&pulse, &self.tone);
            if let Err(err) = backend.emit_pulse(&tone) {
                tracing::warn!(%err, time = pulse.absolute_time, "backend rejected click");
                notifications.push(Notification::BackendError(err.to_string()));
            }
            self.pending.push_back(pulse);
        }
    }

    fn cancel_backend(&mut self, now: f64, notifications: &mut Vec<Notification>) {
        if let Some(backend) = self.backend.as_mut() {
            if let Err(err) = backend.cancel_after(now) {
                tracing::warn!(%err, "backend could not withdraw clicks");
                notifications.push(Notification::BackendError(err.to_string()));
            }
        }
    }

    // Throws away the part of the schedule that has not sounded yet and
    // begins a new grid at `now` with the current tempo.
    fn restart(&mut self, now: f64, resume: Resume, notifications: &mut Vec<Notification>) {
        let first_future = self
            .pending
            .iter()
            .position(|pulse| pulse.absolute_time > now)
            .unwrap_or(self.pending.len());
        let withdrawn = self.pending.split_off(first_future);
        let last_due = self
            .pending
            .back()
            .map(|pulse| pulse.absolute_time)
            .or(self.last_sounded);

        let beat_index = match resume {
            Resume::CurrentBeat => withdrawn
                .front()
                .map(|pulse| pulse.beat_index)
                .unwrap_or_else(|| self.scheduler.next_beat_index()),
            Resume::BarStart => {
                self.pending.clear();
                0
            }
        };
        self.cancel_backend(now, notifications);

        // A click that sounded exactly now must not be doubled.
        let start_at = match last_due {
            Some(time) if time >= now => time + self.tempo.beat_interval_secs(),
            _ => now,
        };
        tracing::debug!(
            start_at,
            beat_index,
            withdrawn = withdrawn.len(),
            "restarting schedule"
        );
        self.scheduler.start(start_at, beat_index);
        self.look_ahead(now, notifications);
    }

    fn take_due_beat(&mut self, now: f64) -> Option<BeatEvent> {
        if !self.tempo.is_playing() {
            return None;
        }
        if self.pending.front()?.absolute_time > now {
            return None;
        }
        let pulse = self.pending.pop_front()?;
        self.tempo.set_current_beat(pulse.beat_index);
        self.last_sounded = Some(pulse.absolute_time);
        Some(BeatEvent::from(&pulse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureBackend;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Recorder {
        beats: RefCell<Vec<BeatEvent>>,
        tempos: RefCell<Vec<u32>>,
        bars: RefCell<Vec<u32>>,
        play_states: RefCell<Vec<bool>>,
    }

    impl SessionListener for Recorder {
        fn on_beat(&self, beat: &BeatEvent) {
            self.beats.borrow_mut().push(*beat);
        }

        fn on_tempo_changed(&self, bpm: u32) {
            self.tempos.borrow_mut().push(bpm);
        }

        fn on_beats_per_bar_changed(&self, beats_per_bar: u32) {
            self.bars.borrow_mut().push(beats_per_bar);
        }

        fn on_play_state_changed(&self, is_playing: bool) {
            self.play_states.borrow_mut().push(is_playing);
        }
    }

    fn session() -> (PlaybackSession, Arc<ManualClock>, CaptureBackend, Rc<Recorder>) {
        let clock = Arc::new(ManualClock::new(10.0));
        let backend = CaptureBackend::new();
        let session =
            PlaybackSession::with_backend(&AppConfig::default(), clock.clone(), backend.clone());
        let recorder = Rc::new(Recorder::default());
        session.subscribe(recorder.clone());
        (session, clock, backend, recorder)
    }

    #[test]
    fn start_emits_first_click_immediately() {
        let (session, _clock, backend, recorder) = session();
        session.start().unwrap();

        let tones = backend.tones();
        assert_eq!(tones.len(), 1);
        assert_eq!(tones[0].time, 10.0);
        assert_eq!(tones[0].frequency_hz, 1000.0);
        assert_eq!(*recorder.play_states.borrow(), vec![true]);
        assert_eq!(session.next_deadline().unwrap(), Some(10.0));
    }

    #[test]
    fn beats_fire_at_pulse_time_not_schedule_time() {
        let (session, clock, _backend, recorder) = session();
        session.set_bpm(120.0).unwrap();
        session.start().unwrap();

        clock.set(10.45);
        session.poll().unwrap();
        assert_eq!(recorder.beats.borrow().len(), 1);

        // Next pulse (10.5) is already enqueued but must not show yet.
        clock.set(10.49);
        session.poll().unwrap();
        assert_eq!(recorder.beats.borrow().len(), 1);

        clock.set(10.5);
        session.poll().unwrap();
        let beats = recorder.beats.borrow();
        assert_eq!(beats.len(), 2);
        assert_eq!(beats[1].beat_index, 1);
        assert_eq!(beats[1].time, 10.5);
    }

    #[test]
    fn tempo_change_on_a_sounding_beat_starts_one_interval_later() {
        let (session, clock, backend, recorder) = session();
        session.set_bpm(120.0).unwrap();
        session.start().unwrap();

        clock.set(10.5);
        session.poll().unwrap();
        assert_eq!(recorder.beats.borrow().len(), 2);

        session.set_bpm(60.0).unwrap();
        clock.set(11.45);
        session.poll().unwrap();

        let times: Vec<f64> = backend.tones().iter().map(|tone| tone.time).collect();
        assert_eq!(times, vec![10.0, 10.5, 11.5]);
        assert_eq!(backend.cancelled().len(), 0);
    }

    #[test]
    fn redundant_start_and_stop_are_no_ops() {
        let (session, _clock, backend, recorder) = session();
        session.stop().unwrap();
        session.start().unwrap();
        session.start().unwrap();

        assert_eq!(backend.tones().len(), 1);
        assert_eq!(*recorder.play_states.borrow(), vec![true]);
    }

    #[test]
    fn unavailable_backend_refuses_start_without_side_effects() {
        let clock = Arc::new(ManualClock::new(0.0));
        let attempts = Rc::new(RefCell::new(0));
        let counter = attempts.clone();
        let session = PlaybackSession::new(&AppConfig::default(), clock, move || {
            *counter.borrow_mut() += 1;
            Err(ClickTrackError::msg("permission denied"))
        });

        let err = session.start().unwrap_err();
        assert!(matches!(err, ClickTrackError::BackendUnavailable(_)));
        assert!(!session.is_playing().unwrap());
        assert_eq!(session.next_deadline().unwrap(), None);

        assert!(session.start().is_err());
        assert_eq!(*attempts.borrow(), 2);
    }

    #[test]
    fn backend_is_created_once_and_reused() {
        let clock = Arc::new(ManualClock::new(0.0));
        let opened = Rc::new(RefCell::new(0));
        let counter = opened.clone();
        let session = PlaybackSession::new(&AppConfig::default(), clock, move || {
            *counter.borrow_mut() += 1;
            Ok(Box::new(CaptureBackend::new()) as Box<dyn AudioBackend>)
        });

        for _ in 0..3 {
            session.start().unwrap();
            session.stop().unwrap();
        }
        assert_eq!(*opened.borrow(), 1);
    }

    #[test]
    fn tap_tempo_updates_bpm_and_notifies() {
        let (session, _clock, _backend, recorder) = session();
        assert_eq!(session.record_tap(1_000.0).unwrap(), None);
        assert_eq!(session.record_tap(1_500.0).unwrap(), Some(120));
        assert_eq!(session.snapshot().unwrap().bpm(), 120);
        assert_eq!(*recorder.tempos.borrow(), vec![120]);

        assert_eq!(session.record_tap(4_500.0).unwrap(), None);
        assert_eq!(session.snapshot().unwrap().bpm(), 120);
    }

    #[test]
    fn bar_change_notifies_and_resets_index() {
        let (session, _clock, _backend, recorder) = session();
        assert_eq!(session.adjust_beats_per_bar(20).unwrap(), 12);
        assert_eq!(session.set_beats_per_bar(0.0).unwrap(), 1);
        assert_eq!(*recorder.bars.borrow(), vec![12, 1]);
        assert_eq!(session.snapshot().unwrap().current_beat_index(), 0);
    }

    #[test]
    fn commands_route_to_session_operations() {
        let (session, _clock, _backend, _recorder) = session();
        session.apply(Command::SetBpm(300.0)).unwrap();
        session.apply(Command::AdjustBpm(-5)).unwrap();
        session.apply(Command::SetBeatsPerBar(3.0)).unwrap();
        session.apply(Command::SetAccentFirst(false)).unwrap();
        session.apply(Command::Toggle).unwrap();

        let state = session.snapshot().unwrap();
        assert_eq!(state.bpm(), 235);
        assert_eq!(state.beats_per_bar(), 3);
        assert!(!state.accent_first_beat());
        assert!(state.is_playing());

        session.apply(Command::Toggle).unwrap();
        assert!(!session.is_playing().unwrap());
    }

    #[test]
    fn weak_handle_does_not_keep_session_alive() {
        let (session, _clock, _backend, _recorder) = session();
        let weak = session.downgrade();
        assert!(weak.upgrade().is_some());
        drop(session);
        assert!(weak.upgrade().is_none());
    }
}
