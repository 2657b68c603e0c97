use std::cell::Cell;
use std::io::BufRead;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand};
use click_track_core::{
    AppConfig, AudioBackend, BeatEvent, CaptureBackend, ClickTrackError, Clock, Command,
    LogBackend, ManualClock, MonotonicClock, PlaybackSession, SessionListener, ToneConfig,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing_subscriber::EnvFilter;

fn main() -> click_track_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play { tempo, config, silent } => run_play(&tempo, config.as_deref(), silent),
        Commands::Trace {
            tempo,
            seconds,
            change_at,
            to,
        } => run_trace(&tempo, seconds, change_at.zip(to)),
    }
}

fn run_play(
    tempo: &TempoArgs,
    config_path: Option<&std::path::Path>,
    silent: bool,
) -> click_track_core::Result<()> {
    let config = match config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let config = tempo.apply(config);
    config.validate()?;
    tracing::info!(silent, bpm = config.tempo.bpm, "starting interactive metronome");

    let clock = Arc::new(MonotonicClock::start());
    let session_clock: Arc<dyn Clock> = clock.clone();
    let tone = config.tone;
    let backend_clock = session_clock.clone();
    let session = PlaybackSession::new(&config, session_clock, move || {
        if silent {
            Ok(Box::new(LogBackend::new()) as Box<dyn AudioBackend>)
        } else {
            open_audible(&backend_clock, tone)
        }
    });
    let view = Rc::new(TerminalView::new(config.tempo.beats_per_bar));
    session.subscribe(view.clone());

    let inputs = spawn_input_thread(clock.clone());
    print_help();
    view.show_status(&session)?;

    loop {
        let input = match session.next_deadline()? {
            Some(deadline) => match inputs.recv_deadline(clock.instant_at(deadline)) {
                Ok(input) => Some(input),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inputs.recv() {
                Ok(input) => Some(input),
                Err(_) => break,
            },
        };

        match input {
            Some(Input::Quit) => break,
            Some(Input::ToggleAccent) => {
                let enabled = !session.snapshot()?.accent_first_beat();
                session.set_accent_first(enabled)?;
                println!("accent on first beat: {}", if enabled { "on" } else { "off" });
            }
            Some(Input::Apply(command)) => match session.apply(command) {
                Ok(()) => {}
                Err(ClickTrackError::BackendUnavailable(reason)) => {
                    println!("cannot start: {reason}");
                }
                Err(err) => return Err(err),
            },
            None => {}
        }

        session.poll()?;
    }

    session.stop()?;
    tracing::info!("metronome closed");
    Ok(())
}

#[cfg(feature = "audio")]
fn open_audible(
    clock: &Arc<dyn Clock>,
    tone: ToneConfig,
) -> click_track_core::Result<Box<dyn AudioBackend>> {
    let backend = click_track_core::CpalBackend::open(clock.clone(), tone)?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "audio"))]
fn open_audible(
    _clock: &Arc<dyn Clock>,
    _tone: ToneConfig,
) -> click_track_core::Result<Box<dyn AudioBackend>> {
    Err(ClickTrackError::backend_unavailable(
        "built without the `audio` feature, rerun with --silent",
    ))
}

fn run_trace(
    tempo: &TempoArgs,
    seconds: f64,
    change: Option<(f64, f64)>,
) -> click_track_core::Result<()> {
    let config = tempo.apply(AppConfig::default());
    config.validate()?;
    tracing::info!(seconds, ?change, "tracing simulated session");

    let clock = Arc::new(ManualClock::new(0.0));
    let backend = CaptureBackend::new();
    let session = PlaybackSession::with_backend(&config, clock.clone(), backend.clone());
    let log = Rc::new(BeatCollector::default());
    session.subscribe(log.clone());

    session.start()?;
    let step = config.scheduler.wake_period_secs();
    let mut change = change;
    while clock.now() < seconds {
        clock.advance(step);
        if let Some((at, bpm)) = change {
            if clock.now() >= at {
                session.set_bpm(bpm)?;
                change = None;
            }
        }
        session.poll()?;
    }
    let state = serde_json::to_string(&session.snapshot()?)?;
    session.stop()?;

    let tones = backend.tones();
    for (beat, tone) in log.beats.take().iter().zip(tones.iter()) {
        let line = serde_json::json!({
            "beat": beat.beat_index,
            "accented": beat.is_accented,
            "tone": tone,
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    tracing::info!(%state, "trace finished");
    Ok(())
}

enum Input {
    Apply(Command),
    ToggleAccent,
    Quit,
}

/// Maps one line of keyboard input to an action. Taps carry `now_ms`.
fn parse_line(line: &str, now_ms: f64) -> Option<Input> {
    let input = match line.trim() {
        "" | "s" => Input::Apply(Command::Toggle),
        "+" => Input::Apply(Command::AdjustBpm(1)),
        "-" => Input::Apply(Command::AdjustBpm(-1)),
        ">" => Input::Apply(Command::AdjustBpm(5)),
        "<" => Input::Apply(Command::AdjustBpm(-5)),
        "t" => Input::Apply(Command::Tap(now_ms)),
        "b+" => Input::Apply(Command::AdjustBeatsPerBar(1)),
        "b-" => Input::Apply(Command::AdjustBeatsPerBar(-1)),
        "a" => Input::ToggleAccent,
        "q" => Input::Quit,
        other => match other.parse::<f64>() {
            Ok(bpm) => Input::Apply(Command::SetBpm(bpm)),
            Err(_) => return None,
        },
    };
    Some(input)
}

fn spawn_input_thread(clock: Arc<MonotonicClock>) -> Receiver<Input> {
    let (sender, receiver): (Sender<Input>, Receiver<Input>) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            // Stamped here so queueing delay does not skew tap tempo.
            let now_ms = clock.now() * 1000.0;
            let Some(input) = parse_line(&line, now_ms) else {
                println!("unrecognised input {line:?}");
                continue;
            };
            let quit = matches!(input, Input::Quit);
            if sender.send(input).is_err() || quit {
                break;
            }
        }
        let _ = sender.send(Input::Quit);
    });
    receiver
}

fn print_help() {
    println!("enter / s  start or stop");
    println!("+ / -      tempo up or down by 1");
    println!("> / <      tempo up or down by 5");
    println!("<number>   set tempo");
    println!("t          tap tempo");
    println!("b+ / b-    beats per bar");
    println!("a          toggle first beat accent");
    println!("q          quit");
}

/// Renders the bar as a row of boxes, one per beat.
fn render_bar(beats_per_bar: u32, current: u32) -> String {
    (0..beats_per_bar)
        .map(|index| if index == current { "[X]" } else { "[ ]" })
        .collect::<Vec<_>>()
        .join(" ")
}

struct TerminalView {
    beats_per_bar: Cell<u32>,
}

impl TerminalView {
    fn new(beats_per_bar: u32) -> Self {
        Self {
            beats_per_bar: Cell::new(beats_per_bar),
        }
    }

    fn show_status(&self, session: &PlaybackSession) -> click_track_core::Result<()> {
        let state = session.snapshot()?;
        self.beats_per_bar.set(state.beats_per_bar());
        println!(
            "{} BPM, {} beats per bar, {}",
            state.bpm(),
            state.beats_per_bar(),
            if state.is_playing() { "playing" } else { "stopped" }
        );
        Ok(())
    }
}

impl SessionListener for TerminalView {
    fn on_beat(&self, beat: &BeatEvent) {
        let marker = if beat.is_accented { '>' } else { ' ' };
        println!("{marker} {}", render_bar(self.beats_per_bar.get(), beat.beat_index));
    }

    fn on_tempo_changed(&self, bpm: u32) {
        println!("tempo {bpm} BPM");
    }

    fn on_beats_per_bar_changed(&self, beats_per_bar: u32) {
        self.beats_per_bar.set(beats_per_bar);
        println!("{beats_per_bar} beats per bar");
    }

    fn on_play_state_changed(&self, is_playing: bool) {
        println!("{}", if is_playing { "playing" } else { "stopped" });
    }

    fn on_backend_error(&self, message: &str) {
        println!("audio error: {message}");
    }
}

#[derive(Default)]
struct BeatCollector {
    beats: Cell<Vec<BeatEvent>>,
}

impl SessionListener for BeatCollector {
    fn on_beat(&self, beat: &BeatEvent) {
        let mut beats = self.beats.take();
        beats.push(*beat);
        self.beats.set(beats);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Look-ahead click track metronome", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TempoArgs {
    /// Initial tempo in beats per minute (clamped to 20..=240).
    #[arg(long)]
    bpm: Option<u32>,
    /// Beats per bar (clamped to 1..=12).
    #[arg(long)]
    beats: Option<u32>,
    /// Play every beat with the regular click.
    #[arg(long)]
    no_accent: bool,
}

impl TempoArgs {
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(bpm) = self.bpm {
            config.tempo.bpm = bpm;
        }
        if let Some(beats) = self.beats {
            config.tempo.beats_per_bar = beats;
        }
        if self.no_accent {
            config.tempo.accent_first_beat = false;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metronome interactively from the terminal.
    Play {
        #[command(flatten)]
        tempo: TempoArgs,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Log clicks instead of opening an audio device.
        #[arg(long)]
        silent: bool,
    },
    /// Simulate a session on a virtual clock and print every beat as JSON.
    Trace {
        #[command(flatten)]
        tempo: TempoArgs,
        /// Length of the simulation in seconds.
        #[arg(long, default_value_t = 4.0)]
        seconds: f64,
        /// Time at which to change tempo.
        #[arg(long, requires = "to")]
        change_at: Option<f64>,
        /// Tempo to switch to at `--change-at`.
        #[arg(long, requires = "change_at")]
        to: Option<f64>,
    },
}
