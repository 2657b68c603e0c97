use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, OutputCallbackInfo, Sample, SampleFormat, SizedSample, Stream,
    StreamConfig,
};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{AudioBackend, ClickMixer, PulseTone};
use crate::clock::Clock;
use crate::config::ToneConfig;
use crate::{ClickTrackError, Result};

const QUEUE_CAPACITY: usize = 256;

enum VoiceMessage {
    Schedule(PulseTone),
    CancelAfter(f64),
}

/// Plays clicks on the default output device.
///
/// Tones travel to the audio thread through a lock-free ring buffer. Each
/// callback maps its buffer onto the session clock (plus the reported output
/// latency) so clicks start on the exact frame their timestamp names.
pub struct CpalBackend {
    _stream: Stream,
    queue: HeapProd<VoiceMessage>,
    sample_rate: u32,
    channels: u16,
}

impl CpalBackend {
    pub fn open(clock: Arc<dyn Clock>, shape: ToneConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ClickTrackError::backend_unavailable("no default output device"))?;

        let supported = device
            .default_output_config()
            .map_err(ClickTrackError::backend_unavailable)?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            ?sample_format,
            "opening audio output"
        );

        let (producer, consumer) = HeapRb::<VoiceMessage>::new(QUEUE_CAPACITY).split();
        let renderer = Renderer {
            queue: consumer,
            clock,
            mixer: ClickMixer::new(shape, f64::from(sample_rate)),
            channels: usize::from(channels),
        };

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, renderer),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, renderer),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, renderer),
            other => {
                return Err(ClickTrackError::backend_unavailable(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }?;
        stream.play().map_err(ClickTrackError::backend_unavailable)?;

        Ok(Self {
            _stream: stream,
            queue: producer,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn send(&mut self, message: VoiceMessage) -> Result<()> {
        self.queue
            .try_push(message)
            .map_err(|_| ClickTrackError::msg("audio queue is full"))
    }
}

impl AudioBackend for CpalBackend {
    fn emit_pulse(&mut self, tone: &PulseTone) -> Result<()> {
        self.send(VoiceMessage::Schedule(*tone))
    }

    fn cancel_after(&mut self, time: f64) -> Result<()> {
        self.send(VoiceMessage::CancelAfter(time))
    }
}

impl std::fmt::Debug for CpalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalBackend")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

struct Renderer {
    queue: HeapCons<VoiceMessage>,
    clock: Arc<dyn Clock>,
    mixer: ClickMixer,
    channels: usize,
}

impl Renderer {
    // Runs on the audio thread. No locks; only the drop warning allocates.
    fn render<T>(&mut self, data: &mut [T], latency: Duration)
    where
        T: SizedSample + FromSample<f32>,
    {
        let start = self.clock.now() + latency.as_secs_f64();
        while let Some(message) = self.queue.try_pop() {
            match message {
                // Due clicks start on the first frame of this buffer.
                VoiceMessage::Schedule(tone) => {
                    self.mixer.schedule(tone, start);
                }
                VoiceMessage::CancelAfter(time) => self.mixer.cancel_after(time),
            }
        }

        let sample_rate = self.mixer.sample_rate();
        let mut frames = 0;
        for (index, frame) in data.chunks_mut(self.channels).enumerate() {
            let value = T::from_sample(self.mixer.sample_at(start + index as f64 / sample_rate));
            for sample in frame.iter_mut() {
                *sample = value;
            }
            frames = index + 1;
        }
        self.mixer.retire_before(start + frames as f64 / sample_rate);

        let dropped = self.mixer.take_dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "voice pool full, clicks dropped");
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut renderer: Renderer,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &OutputCallbackInfo| {
                let timestamp = info.timestamp();
                let latency = timestamp
                    .playback
                    .duration_since(&timestamp.callback)
                    .unwrap_or_default();
                renderer.render(data, latency);
            },
            |err| tracing::warn!(%err, "audio stream error"),
            None,
        )
        .map_err(ClickTrackError::backend_unavailable)
}
