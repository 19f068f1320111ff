//! # Audio Capture
//!
//! The capture side of a voice session: acquire a microphone, then produce a
//! continuous sequence of [`AudioFrameBuffer`]s at a fixed processing
//! interval (`frame_size / sample_rate` seconds).
//!
//! ## Two-Step Lifecycle:
//! 1. **open**: asks the device for access. Permission denial and missing
//!    devices fail here, before anything else about the session exists.
//! 2. **start**: connects the processing node. From now on one frame per
//!    interval is pushed into a bounded channel; if the consumer lags the
//!    newest frame is dropped instead of queueing without bound.
//!
//! `stop` disconnects the node and is safe to call any number of times.

use crate::audio::buffer::AudioFrameBuffer;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames buffered between the processing node and the session.
const FRAME_QUEUE: usize = 8;

/// What a session asks the microphone for.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
}

/// Produces captured frames on demand, one per processing interval.
pub trait FrameSource: Send {
    fn sample_rate(&self) -> u32;

    fn next_frame(&mut self, frame_size: usize, sequence: u64) -> AudioFrameBuffer;
}

/// A microphone that can be opened.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the input. Fails with `PipelineError::Permission` when access
    /// is denied and `PipelineError::Capture` when there is no usable input.
    async fn open(&self, request: &CaptureRequest) -> Result<CaptureStream, PipelineError>;
}

/// An acquired microphone, idle until [`CaptureStream::start`].
pub struct CaptureStream {
    source: Option<Box<dyn FrameSource>>,
    frame_size: usize,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl CaptureStream {
    pub fn new(source: Box<dyn FrameSource>, frame_size: usize) -> Self {
        Self {
            source: Some(source),
            frame_size: frame_size.max(1),
            task: None,
            stopped: false,
        }
    }

    /// Time between two frames.
    pub fn interval(&self) -> Duration {
        let rate = self.source.as_ref().map(|s| s.sample_rate()).unwrap_or(0);
        if rate == 0 {
            return Duration::from_millis(100);
        }
        Duration::from_secs_f64(self.frame_size as f64 / rate as f64)
    }

    /// Connect the processing node and return the frame channel.
    pub fn start(&mut self) -> Result<mpsc::Receiver<AudioFrameBuffer>, PipelineError> {
        if self.stopped {
            return Err(PipelineError::InvalidState("capture stream was stopped".to_string()));
        }
        let period = self.interval();
        let Some(mut source) = self.source.take() else {
            return Err(PipelineError::InvalidState("capture stream already started".to_string()));
        };

        let frame_size = self.frame_size;
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately; a frame is only ready
            // after one full interval of audio
            ticker.tick().await;

            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                let frame = source.next_frame(frame_size, sequence);
                sequence += 1;

                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(sequence, "Capture consumer lagging, dropped frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }));

        debug!(interval_ms = period.as_millis() as u64, frame_size, "Capture started");
        Ok(rx)
    }

    /// Disconnect the processing node. Returns `true` if it was running.
    pub fn stop(&mut self) -> bool {
        self.stopped = true;
        self.source = None;
        match self.task.take() {
            Some(task) => {
                task.abort();
                debug!("Capture stopped");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|task| !task.is_finished()).unwrap_or(false)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Where the simulated microphone gets its audio.
///
/// ## Config values:
/// - `silence`: zeros
/// - `tone` / `tone:<hz>`: a sine wave at amplitude 0.25
/// - `denied`: the user refused microphone access
/// - `wav:<path>`: a WAV file, looped
#[derive(Debug, Clone, PartialEq)]
pub enum MicrophoneSource {
    Silence,
    Tone { frequency_hz: f32 },
    Denied,
    Wav(PathBuf),
}

impl std::str::FromStr for MicrophoneSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        match value.to_lowercase().as_str() {
            "" => Err("Microphone source cannot be empty".to_string()),
            "silence" => Ok(MicrophoneSource::Silence),
            "denied" => Ok(MicrophoneSource::Denied),
            "tone" => Ok(MicrophoneSource::Tone { frequency_hz: 440.0 }),
            lower if lower.starts_with("tone:") => {
                let frequency_hz: f32 = lower["tone:".len()..]
                    .parse()
                    .map_err(|_| format!("Invalid tone frequency: {}", value))?;
                if frequency_hz <= 0.0 {
                    return Err(format!("Tone frequency must be positive: {}", value));
                }
                Ok(MicrophoneSource::Tone { frequency_hz })
            }
            lower if lower.starts_with("wav:") => {
                let path = value["wav:".len()..].trim();
                if path.is_empty() {
                    return Err(format!("WAV microphone source needs a path: {}", value));
                }
                Ok(MicrophoneSource::Wav(PathBuf::from(path)))
            }
            _ => Err(format!(
                "Unknown microphone source '{}', expected silence, denied, tone[:hz] or wav:<path>",
                value
            )),
        }
    }
}

/// Microphone backed by a configured [`MicrophoneSource`].
pub struct SimulatedMicrophone {
    source: MicrophoneSource,
}

impl SimulatedMicrophone {
    pub fn new(source: MicrophoneSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl CaptureDevice for SimulatedMicrophone {
    async fn open(&self, request: &CaptureRequest) -> Result<CaptureStream, PipelineError> {
        let source: Box<dyn FrameSource> = match &self.source {
            MicrophoneSource::Denied => {
                return Err(PipelineError::Permission("microphone access was denied".to_string()));
            }
            MicrophoneSource::Silence => Box::new(SilenceSource {
                sample_rate: request.sample_rate,
                channels: request.channels,
            }),
            MicrophoneSource::Tone { frequency_hz } => Box::new(ToneSource {
                sample_rate: request.sample_rate,
                frequency_hz: *frequency_hz,
                amplitude: 0.25,
                phase: 0.0,
            }),
            MicrophoneSource::Wav(path) => {
                let source = WavSource::load(path.clone()).await?;
                if source.sample_rate != request.sample_rate {
                    warn!(
                        file_rate = source.sample_rate,
                        requested_rate = request.sample_rate,
                        "WAV capture rate differs from the requested rate, frames keep the file rate"
                    );
                }
                Box::new(source)
            }
        };

        info!(source = ?self.source, frame_size = request.frame_size, "Microphone opened");
        Ok(CaptureStream::new(source, request.frame_size))
    }
}

struct SilenceSource {
    sample_rate: u32,
    channels: u16,
}

impl FrameSource for SilenceSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self, frame_size: usize, sequence: u64) -> AudioFrameBuffer {
        let channels = usize::from(self.channels.max(1));
        AudioFrameBuffer::new(vec![vec![0.0; frame_size]; channels], self.sample_rate, sequence)
    }
}

struct ToneSource {
    sample_rate: u32,
    frequency_hz: f32,
    amplitude: f32,
    phase: f32,
}

impl FrameSource for ToneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self, frame_size: usize, sequence: u64) -> AudioFrameBuffer {
        let step = 2.0 * std::f32::consts::PI * self.frequency_hz / self.sample_rate.max(1) as f32;
        let samples = (0..frame_size)
            .map(|_| {
                let sample = self.amplitude * self.phase.sin();
                self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
                sample
            })
            .collect();
        AudioFrameBuffer::mono(samples, self.sample_rate, sequence)
    }
}

/// First channel of a WAV file, replayed in a loop.
struct WavSource {
    samples: Vec<f32>,
    sample_rate: u32,
    position: usize,
}

impl WavSource {
    async fn load(path: PathBuf) -> Result<Self, PipelineError> {
        let path_text = path.display().to_string();
        let (header, data) = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            wav::read(&mut file)
        })
        .await
        .map_err(|e| PipelineError::Capture(format!("WAV reader task failed: {}", e)))?
        .map_err(|e| PipelineError::Capture(format!("cannot read {}: {}", path_text, e)))?;

        let channels = usize::from(header.channel_count.max(1));
        let interleaved: Vec<f32> = match data {
            wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (f32::from(s) - 128.0) / 128.0).collect(),
            wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| f32::from(s) / 32768.0).collect(),
            wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
            wav::BitDepth::ThirtyTwoFloat(samples) => samples,
            wav::BitDepth::Empty => Vec::new(),
        };
        let samples: Vec<f32> = interleaved.iter().step_by(channels).copied().collect();

        if samples.is_empty() || header.sampling_rate == 0 {
            return Err(PipelineError::Capture(format!("{} contains no audio", path_text)));
        }

        debug!(path = %path_text, frames = samples.len(), rate = header.sampling_rate, "Loaded WAV capture source");
        Ok(Self {
            samples,
            sample_rate: header.sampling_rate,
            position: 0,
        })
    }
}

impl FrameSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self, frame_size: usize, sequence: u64) -> AudioFrameBuffer {
        let mut frame = Vec::with_capacity(frame_size);
        while frame.len() < frame_size {
            let remaining = self.samples.len() - self.position;
            let take = remaining.min(frame_size - frame.len());
            frame.extend_from_slice(&self.samples[self.position..self.position + take]);
            self.position = (self.position + take) % self.samples.len();
        }
        AudioFrameBuffer::mono(frame, self.sample_rate, sequence)
    }
}
