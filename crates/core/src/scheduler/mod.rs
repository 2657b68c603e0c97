use crate::config::SchedulerConfig;
use crate::tempo::TempoState;

/// One click, fixed at the moment the look-ahead pass computed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPulse {
    pub beat_index: u32,
    /// Seconds on the session clock at which the click must sound.
    pub absolute_time: f64,
    pub is_accented: bool,
}

/// Look-ahead pulse scheduler.
///
/// A coarse, late-firing wake-up calls [`Scheduler::fill`] every
/// `wake_period`. Each pass enqueues every pulse that falls inside the
/// `lookahead` window with its exact target time, so onset precision comes
/// from the audio backend rather than from the wake-up.
#[derive(Debug, Clone)]
pub struct Scheduler {
    lookahead: f64,
    wake_period: f64,
    next_pulse_time: f64,
    next_beat_index: u32,
    next_wake: Option<f64>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            lookahead: config.lookahead_secs(),
            wake_period: config.wake_period_secs(),
            next_pulse_time: 0.0,
            next_beat_index: 0,
            next_wake: None,
        }
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    pub fn wake_period(&self) -> f64 {
        self.wake_period
    }

    pub fn is_running(&self) -> bool {
        self.next_wake.is_some()
    }

    /// Time of the next pending wake-up, `None` while stopped.
    pub fn next_wake(&self) -> Option<f64> {
        self.next_wake
    }

    pub fn next_pulse_time(&self) -> f64 {
        self.next_pulse_time
    }

    pub fn next_beat_index(&self) -> u32 {
        self.next_beat_index
    }

    /// Begins a fresh pulse grid whose first click sounds at `at`.
    /// The wake-up is due immediately.
    pub fn start(&mut self, at: f64, beat_index: u32) {
        self.next_pulse_time = at;
        self.next_beat_index = beat_index;
        self.next_wake = Some(at);
    }

    /// Cancels the pending wake-up. Nothing is emitted until the next `start`.
    pub fn stop(&mut self) {
        self.next_wake = None;
    }

    pub fn is_wake_due(&self, now: f64) -> bool {
        self.next_wake.is_some_and(|wake| now >= wake)
    }

    /// Runs one look-ahead pass and re-arms the wake-up `wake_period` later.
    ///
    /// Beat index and accent are decided here, at emission time, from the
    /// current `tempo`. Returns no pulses while stopped.
    pub fn fill(&mut self, now: f64, tempo: &TempoState) -> Vec<ScheduledPulse> {
        if !self.is_running() {
            return Vec::new();
        }

        let interval = tempo.beat_interval_secs();
        self.skip_missed_beats(now, interval, tempo);

        let horizon = now + self.lookahead;
        let mut pulses = Vec::new();
        while self.next_pulse_time < horizon {
            let beat_index = self.next_beat_index % tempo.beats_per_bar();
            pulses.push(ScheduledPulse {
                beat_index,
                absolute_time: self.next_pulse_time,
                is_accented: tempo.is_accented(beat_index),
            });
            self.next_pulse_time += interval;
            self.next_beat_index = tempo.next_beat_after(beat_index);
        }

        self.next_wake = Some(now + self.wake_period);
        pulses
    }

    // After a stall longer than the window, the overdue beats would otherwise
    // fire as one burst. Drop them but stay on the same grid.
    fn skip_missed_beats(&mut self, now: f64, interval: f64, tempo: &TempoState) {
        let behind = now - self.lookahead - self.next_pulse_time;
        if behind <= 0.0 {
            return;
        }
        let missed = (behind / interval).ceil() as u32;
        tracing::warn!(missed, behind, "wake-up stalled, skipping overdue beats");
        self.next_pulse_time += f64::from(missed) * interval;
        self.next_beat_index = (self.next_beat_index + missed) % tempo.beats_per_bar();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn tempo(bpm: f64, beats: f64) -> TempoState {
        let mut tempo = TempoState::new();
        tempo.set_bpm(bpm);
        tempo.set_beats_per_bar(beats);
        tempo
    }

    fn run(
        scheduler: &mut Scheduler,
        tempo: &TempoState,
        from: f64,
        until: f64,
        step: f64,
    ) -> Vec<ScheduledPulse> {
        let mut pulses = Vec::new();
        let mut now = from;
        while now < until {
            if scheduler.is_wake_due(now) {
                pulses.extend(scheduler.fill(now, tempo));
            }
            now += step;
        }
        pulses
    }

    #[test]
    fn first_pass_emits_pulse_at_start_time() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(120.0, 4.0);
        scheduler.start(2.0, 0);

        let pulses = scheduler.fill(2.0, &tempo);
        assert_eq!(pulses.len(), 1);
        assert_eq!(pulses[0].absolute_time, 2.0);
        assert_eq!(pulses[0].beat_index, 0);
        assert!(pulses[0].is_accented);
        assert!((scheduler.next_wake().unwrap() - 2.025).abs() < EPS);
    }

    #[test]
    fn pulses_are_exactly_one_interval_apart() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(97.0, 4.0);
        scheduler.start(0.0, 0);

        let pulses = run(&mut scheduler, &tempo, 0.0, 15.0, 0.025);
        assert!(pulses.len() >= 20);
        let interval = 60.0 / 97.0;
        for (n, pair) in pulses.windows(2).enumerate() {
            let gap = pair[1].absolute_time - pair[0].absolute_time;
            assert!((gap - interval).abs() < EPS, "gap {n} was {gap}");
        }
        for (n, pulse) in pulses.iter().enumerate() {
            assert!((pulse.absolute_time - n as f64 * interval).abs() < 1e-6);
        }
    }

    #[test]
    fn late_wake_ups_do_not_move_pulse_times() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(180.0, 3.0);
        scheduler.start(0.0, 0);

        // Wake-ups that arrive up to 60 ms late, never early.
        let lateness = [0.0, 0.06, 0.013, 0.041, 0.0, 0.055, 0.02];
        let mut pulses = Vec::new();
        let mut now = 0.0;
        for i in 0..200 {
            pulses.extend(scheduler.fill(now, &tempo));
            now = scheduler.next_wake().unwrap() + lateness[i % lateness.len()];
        }

        let interval = 60.0 / 180.0;
        for (n, pulse) in pulses.iter().enumerate() {
            assert!((pulse.absolute_time - n as f64 * interval).abs() < 1e-6);
        }
    }

    #[test]
    fn every_pulse_is_enqueued_ahead_of_its_time() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(240.0, 4.0);
        scheduler.start(0.0, 0);

        let mut now = 0.0;
        for _ in 0..100 {
            for pulse in scheduler.fill(now, &tempo) {
                assert!(pulse.absolute_time >= now);
                assert!(pulse.absolute_time < now + scheduler.lookahead());
            }
            now = scheduler.next_wake().unwrap();
        }
    }

    #[test]
    fn beat_indices_cycle_without_gaps() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(200.0, 3.0);
        scheduler.start(0.0, 0);

        let pulses = run(&mut scheduler, &tempo, 0.0, 6.0, 0.025);
        for (n, pulse) in pulses.iter().enumerate() {
            assert_eq!(pulse.beat_index, (n % 3) as u32);
            assert_eq!(pulse.is_accented, pulse.beat_index == 0);
        }
    }

    #[test]
    fn accent_flag_is_read_per_pulse() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let mut tempo = tempo(120.0, 2.0);
        scheduler.start(0.0, 0);

        let first = scheduler.fill(0.0, &tempo);
        assert!(first[0].is_accented);

        tempo.set_accent_first_beat(false);
        let pulses = run(&mut scheduler, &tempo, 0.025, 3.0, 0.025);
        assert!(pulses.iter().all(|pulse| !pulse.is_accented));
        assert!(pulses.iter().any(|pulse| pulse.beat_index == 0));
    }

    #[test]
    fn stopped_scheduler_emits_nothing() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(120.0, 4.0);
        scheduler.start(0.0, 0);
        scheduler.fill(0.0, &tempo);
        scheduler.stop();

        assert!(!scheduler.is_running());
        assert!(!scheduler.is_wake_due(10.0));
        assert!(scheduler.fill(10.0, &tempo).is_empty());
    }

    #[test]
    fn long_stall_skips_overdue_beats_on_grid() {
        let mut scheduler = Scheduler::new(&SchedulerConfig::default());
        let tempo = tempo(120.0, 4.0);
        scheduler.start(0.0, 0);
        scheduler.fill(0.0, &tempo);

        let pulses = scheduler.fill(2.45, &tempo);
        assert_eq!(pulses.len(), 1);
        assert!((pulses[0].absolute_time - 2.5).abs() < EPS);
        assert_eq!(pulses[0].beat_index, 1);
    }
}
