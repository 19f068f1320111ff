//! # Audio Output Contexts
//!
//! An output context is the playback clock plus the set of buffer sources
//! scheduled against it. Every session and every one-shot player opens its
//! own context from an [`OutputDevice`]; nothing here is a process-wide
//! singleton.
//!
//! ## Virtual Output:
//! [`VirtualOutputDevice`] is the software output used by the service. Its
//! clock is `tokio::time`, so tests can pause and advance it. A scheduled
//! source arms a timer for `when + duration`; when the timer fires the source
//! id is reported on the completions channel. Stopping a source aborts its
//! timer, so a stopped source never reports completion.
//!
//! A context has a fixed channel layout. Buffers in another layout are fitted
//! to it when they are scheduled.
//!
//! When a recordings directory is configured the context mixes everything it
//! played into a mono 16-bit WAV file when it is closed. The file is written
//! on the blocking pool.

use crate::audio::buffer::PlayableBuffer;
use crate::error::PipelineError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle of one scheduled buffer source.
pub type SourceId = u64;

/// Lifecycle of an output context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    /// Created but not yet allowed to play (needs `resume`)
    Suspended,
    Closed,
}

/// A playback clock with schedulable buffer sources.
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Seconds on this context's clock.
    fn current_time(&self) -> f64;

    fn state(&self) -> ContextState;

    fn resume(&mut self) -> Result<(), PipelineError>;

    /// Schedule `buffer` to start at `when` (context seconds).
    fn start_source(&mut self, buffer: PlayableBuffer, when: f64) -> Result<SourceId, PipelineError>;

    /// Stop a source. Returns `false` when the id is unknown or the source
    /// already finished; never fails.
    fn stop_source(&mut self, id: SourceId) -> bool;

    /// Channel of sources that finished naturally. Can be taken once.
    fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>>;

    /// Stop everything and release the context. Idempotent.
    fn close(&mut self);
}

/// Opens output contexts.
pub trait OutputDevice: Send + Sync {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>, PipelineError>;
}

/// Software output device.
///
/// ## Usage:
/// ```ignore
/// let device = VirtualOutputDevice::new().with_recordings("recordings");
/// let mut ctx = device.open(24000, 1)?;
/// ```
#[derive(Default)]
pub struct VirtualOutputDevice {
    recordings_dir: Option<PathBuf>,
    start_suspended: bool,
}

impl VirtualOutputDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mix each closed context into `<dir>/<label>.wav`.
    pub fn with_recordings(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recordings_dir = Some(dir.into());
        self
    }

    /// New contexts start suspended and must be resumed before playing.
    #[cfg(test)]
    pub fn start_suspended(mut self) -> Self {
        self.start_suspended = true;
        self
    }
}

impl OutputDevice for VirtualOutputDevice {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>, PipelineError> {
        Ok(Box::new(VirtualOutputContext::new(
            sample_rate,
            channels,
            self.start_suspended,
            self.recordings_dir.as_deref(),
        )?))
    }
}

/// A source kept for the mixdown.
struct RecordedSource {
    start: f64,
    stopped_at: Option<f64>,
    buffer: PlayableBuffer,
}

/// Clock-driven output context, see the module docs.
pub struct VirtualOutputContext {
    label: String,
    sample_rate: u32,
    channels: u16,
    origin: Instant,
    state: ContextState,
    next_id: SourceId,
    /// Completion timers of sources that have not been stopped
    sources: HashMap<SourceId, JoinHandle<()>>,
    completions_tx: mpsc::UnboundedSender<SourceId>,
    completions_rx: Option<mpsc::UnboundedReceiver<SourceId>>,
    recording: Option<PathBuf>,
    recorded: HashMap<SourceId, RecordedSource>,
}

impl VirtualOutputContext {
    fn new(
        sample_rate: u32,
        channels: u16,
        suspended: bool,
        recordings_dir: Option<&Path>,
    ) -> Result<Self, PipelineError> {
        if sample_rate == 0 {
            return Err(PipelineError::Output("sample rate must be greater than 0".to_string()));
        }

        let label = format!("output-{}", uuid::Uuid::new_v4());
        let recording = recordings_dir.map(|dir| dir.join(format!("{}.wav", label)));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        debug!(label = %label, sample_rate, channels, "Opened virtual output context");

        Ok(Self {
            label,
            sample_rate,
            channels: channels.max(1),
            origin: Instant::now(),
            state: if suspended {
                ContextState::Suspended
            } else {
                ContextState::Running
            },
            next_id: 1,
            sources: HashMap::new(),
            completions_tx,
            completions_rx: Some(completions_rx),
            recording,
            recorded: HashMap::new(),
        })
    }

    /// Hand the recorded sources to the blocking pool for the WAV write.
    fn flush_recording(&mut self) {
        let Some(path) = self.recording.clone() else {
            return;
        };
        let sources: Vec<RecordedSource> = self.recorded.drain().map(|(_, source)| source).collect();
        let sample_rate = self.sample_rate;
        let label = self.label.clone();

        let write = move || match write_recording(&path, sample_rate, &sources) {
            Ok(()) => info!(label = %label, path = %path.display(), "Wrote output recording"),
            Err(e) => warn!(label = %label, path = %path.display(), error = %e, "Failed to write output recording"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(write);
            }
            // closed from a drop outside the runtime
            Err(_) => write(),
        }
    }
}

/// Mix recorded sources into a mono timeline and write it as 16-bit WAV.
fn write_recording(path: &Path, sample_rate: u32, sources: &[RecordedSource]) -> std::io::Result<()> {
    let rate = f64::from(sample_rate);
    let mut timeline: Vec<f32> = Vec::new();
    for source in sources {
        let offset = (source.start * rate).round() as usize;
        let mut samples = source.buffer.mixdown();
        if let Some(stopped_at) = source.stopped_at {
            let played = ((stopped_at - source.start).max(0.0) * rate).round() as usize;
            samples.truncate(played);
        }
        if timeline.len() < offset + samples.len() {
            timeline.resize(offset + samples.len(), 0.0);
        }
        for (slot, sample) in timeline[offset..].iter_mut().zip(samples) {
            *slot += sample;
        }
    }

    let pcm: Vec<i16> = timeline
        .iter()
        .map(|sample| (sample * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut file = std::fs::File::create(path)?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file)
}

impl OutputContext for VirtualOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn current_time(&self) -> f64 {
        match self.state {
            ContextState::Suspended => 0.0,
            _ => self.origin.elapsed().as_secs_f64(),
        }
    }

    fn state(&self) -> ContextState {
        self.state
    }

    fn resume(&mut self) -> Result<(), PipelineError> {
        match self.state {
            ContextState::Running => Ok(()),
            ContextState::Suspended => {
                // the clock starts when playback is first allowed
                self.origin = Instant::now();
                self.state = ContextState::Running;
                debug!(label = %self.label, "Virtual output context resumed");
                Ok(())
            }
            ContextState::Closed => Err(PipelineError::Output("context is closed".to_string())),
        }
    }

    fn start_source(&mut self, buffer: PlayableBuffer, when: f64) -> Result<SourceId, PipelineError> {
        match self.state {
            ContextState::Running => {}
            ContextState::Suspended => {
                return Err(PipelineError::Output("context is suspended".to_string()));
            }
            ContextState::Closed => return Err(PipelineError::Output("context is closed".to_string())),
        }

        self.sources.retain(|_, timer| !timer.is_finished());

        let id = self.next_id;
        self.next_id += 1;

        let buffer = buffer.with_channel_count(self.channels);
        let start = when.max(self.current_time());
        let deadline = self.origin + Duration::from_secs_f64(start + buffer.duration_secs());
        let completions = self.completions_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = completions.send(id);
        });

        if self.recording.is_some() {
            self.recorded.insert(
                id,
                RecordedSource {
                    start,
                    stopped_at: None,
                    buffer,
                },
            );
        }
        self.sources.insert(id, timer);

        Ok(id)
    }

    fn stop_source(&mut self, id: SourceId) -> bool {
        let Some(timer) = self.sources.remove(&id) else {
            return false;
        };
        if timer.is_finished() {
            return false;
        }
        timer.abort();

        let now = self.current_time();
        if let Some(source) = self.recorded.get_mut(&id) {
            source.stopped_at = Some(now.max(source.start));
        }
        true
    }

    fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
        self.completions_rx.take()
    }

    fn close(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }

        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.stop_source(id);
        }
        self.state = ContextState::Closed;
        self.flush_recording();
        debug!(label = %self.label, "Virtual output context closed");
    }
}

impl Drop for VirtualOutputContext {
    fn drop(&mut self) {
        for timer in self.sources.values() {
            timer.abort();
        }
    }
}

/// Output wrapper that logs what each context was asked to do.
#[cfg(test)]
pub(crate) mod probe {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub struct ScheduledPlayback {
        pub source: SourceId,
        pub start: f64,
        pub duration: f64,
        pub channels: usize,
        /// Context time at which the source was stopped early, if it was
        pub stopped_at: Option<f64>,
    }

    #[derive(Debug, Default)]
    pub struct ContextProbe {
        pub scheduled: Vec<ScheduledPlayback>,
        pub closed: bool,
    }

    pub type ProbeHandle = Arc<Mutex<ContextProbe>>;

    #[derive(Default)]
    pub struct ProbedOutput {
        inner: VirtualOutputDevice,
        probes: Mutex<Vec<ProbeHandle>>,
    }

    impl ProbedOutput {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn wrap(inner: VirtualOutputDevice) -> Self {
            Self {
                inner,
                probes: Mutex::new(Vec::new()),
            }
        }

        /// Probes of every context opened so far, oldest first.
        pub fn probes(&self) -> Vec<ProbeHandle> {
            self.probes.lock().unwrap().clone()
        }
    }

    impl OutputDevice for ProbedOutput {
        fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>, PipelineError> {
            let inner = self.inner.open(sample_rate, channels)?;
            let probe = ProbeHandle::default();
            self.probes.lock().unwrap().push(Arc::clone(&probe));
            Ok(Box::new(ProbedContext { inner, probe }))
        }
    }

    struct ProbedContext {
        inner: Box<dyn OutputContext>,
        probe: ProbeHandle,
    }

    impl OutputContext for ProbedContext {
        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn channels(&self) -> u16 {
            self.inner.channels()
        }

        fn current_time(&self) -> f64 {
            self.inner.current_time()
        }

        fn state(&self) -> ContextState {
            self.inner.state()
        }

        fn resume(&mut self) -> Result<(), PipelineError> {
            self.inner.resume()
        }

        fn start_source(&mut self, buffer: PlayableBuffer, when: f64) -> Result<SourceId, PipelineError> {
            let start = when.max(self.inner.current_time());
            let duration = buffer.duration_secs();
            let channels = usize::from(self.inner.channels());
            let source = self.inner.start_source(buffer, when)?;
            self.probe.lock().unwrap().scheduled.push(ScheduledPlayback {
                source,
                start,
                duration,
                channels,
                stopped_at: None,
            });
            Ok(source)
        }

        fn stop_source(&mut self, id: SourceId) -> bool {
            let now = self.inner.current_time();
            let stopped = self.inner.stop_source(id);
            if stopped {
                let mut probe = self.probe.lock().unwrap();
                if let Some(entry) = probe.scheduled.iter_mut().find(|entry| entry.source == id) {
                    entry.stopped_at = Some(now.max(entry.start));
                }
            }
            stopped
        }

        fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
            self.inner.take_completions()
        }

        fn close(&mut self) {
            self.inner.close();
            self.probe.lock().unwrap().closed = true;
        }
    }
}
