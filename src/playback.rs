//! # One-Shot Playback
//!
//! Plays a single pre-encoded payload (a voicemail) from start to finish with
//! an elapsed-seconds counter and cancellation.
//!
//! ## State Machine:
//! ```text
//! Idle -> Loading -> Playing -> Idle   (natural end)
//!                    Playing -> Idle   (stop)
//! ```
//! There is no paused state. Toggling a playing item stops it and the next
//! play starts from zero.
//!
//! ## Rust Concepts:
//! - **Generation counter**: every play and stop bumps it. A play that was
//!   overtaken while it was loading sees a newer generation and backs out.
//! - **Lock order**: status before context, everywhere, so the completion
//!   pump, the ticker and the HTTP handlers never deadlock.

use crate::audio::codec::{self, EncodedAudioChunk};
use crate::audio::output::{ContextState, OutputContext, OutputDevice, SourceId};
use crate::error::PipelineError;
use crate::persona::VoicemailEntry;
use crate::synthesis::SpeechSynthesizer;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
}

/// Result of a play or toggle request. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlayOutcome {
    Playing { item_id: String, duration_secs: f64 },
    Stopped { item_id: String },
    /// Another play or a stop took over while audio was loading
    Cancelled { item_id: String },
    Failed { item_id: String, reason: String },
}

/// What the UI shows for voicemail playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoicemailPlaybackState {
    pub state: PlaybackState,
    pub item_id: Option<String>,
    pub is_playing: bool,
    pub elapsed_seconds: u64,
    pub cached_items: Vec<String>,
}

struct Status {
    state: PlaybackState,
    item_id: Option<String>,
    source: Option<SourceId>,
    elapsed: u64,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
}

impl Status {
    fn reset(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.state = PlaybackState::Idle;
        self.item_id = None;
        self.source = None;
        self.elapsed = 0;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single-stream player for voicemail.
///
/// ## Ownership:
/// The controller owns one output context, created on first play and reused
/// after that. It is released by [`PlaybackController::shutdown`].
pub struct PlaybackController {
    device: Arc<dyn OutputDevice>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sample_rate: u32,
    channels: u16,
    context: Mutex<Option<Box<dyn OutputContext>>>,
    cache: Mutex<HashMap<String, EncodedAudioChunk>>,
    status: Arc<Mutex<Status>>,
    completion_pump: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackController {
    pub fn new(
        device: Arc<dyn OutputDevice>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            device,
            synthesizer,
            sample_rate,
            channels: channels.max(1),
            context: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            status: Arc::new(Mutex::new(Status {
                state: PlaybackState::Idle,
                item_id: None,
                source: None,
                elapsed: 0,
                generation: 0,
                ticker: None,
            })),
            completion_pump: Mutex::new(None),
        }
    }

    /// Play `item` from the start, stopping whatever was playing.
    pub async fn play(&self, item: &VoicemailEntry) -> PlayOutcome {
        self.stop();

        let generation = {
            let mut status = lock(&self.status);
            status.generation += 1;
            status.state = PlaybackState::Loading;
            status.item_id = Some(item.id.clone());
            status.generation
        };

        if let Err(e) = self.ensure_context() {
            return self.fail(generation, item, e);
        }

        let cached = lock(&self.cache).get(&item.id).cloned();
        let chunk = match cached {
            Some(chunk) => {
                debug!(item = %item.id, "Voicemail audio served from cache");
                chunk
            }
            None => match self.synthesizer.synthesize(&item.text, &item.voice).await {
                Ok(chunk) => {
                    lock(&self.cache).insert(item.id.clone(), chunk.clone());
                    chunk
                }
                Err(e) => return self.fail(generation, item, e),
            },
        };

        let buffer = match codec::decode_chunk(&chunk, self.sample_rate) {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(generation, item, e),
        };
        let duration_secs = buffer.duration_secs();

        let mut status = lock(&self.status);
        if status.generation != generation {
            debug!(item = %item.id, "Voicemail playback superseded while loading");
            return PlayOutcome::Cancelled {
                item_id: item.id.clone(),
            };
        }

        let started = {
            let mut context = lock(&self.context);
            match context.as_mut() {
                Some(context) => {
                    let now = context.current_time();
                    context.start_source(buffer, now)
                }
                None => Err(PipelineError::Output("output context was released".to_string())),
            }
        };
        let source = match started {
            Ok(source) => source,
            Err(e) => {
                status.reset();
                drop(status);
                return self.failed(item, e);
            }
        };

        status.state = PlaybackState::Playing;
        status.source = Some(source);
        status.elapsed = 0;
        status.ticker = Some(self.spawn_ticker(generation));
        drop(status);

        info!(item = %item.id, voice = %item.voice, duration_secs, "Voicemail playing");
        PlayOutcome::Playing {
            item_id: item.id.clone(),
            duration_secs,
        }
    }

    /// Stop playback. Safe when idle. Returns `true` if something was
    /// loading or playing.
    pub fn stop(&self) -> bool {
        let mut status = lock(&self.status);
        status.generation += 1;
        let was_active = status.state != PlaybackState::Idle;
        let source = status.source;
        status.reset();

        if let Some(id) = source {
            if let Some(context) = lock(&self.context).as_mut() {
                // an already-finished source is not an error
                context.stop_source(id);
            }
        }

        if was_active {
            debug!("Voicemail playback stopped");
        }
        was_active
    }

    /// Stop `item` if it is the one playing, otherwise play it.
    pub async fn toggle(&self, item: &VoicemailEntry) -> PlayOutcome {
        let is_current = {
            let status = lock(&self.status);
            status.state != PlaybackState::Idle && status.item_id.as_deref() == Some(item.id.as_str())
        };

        if is_current {
            self.stop();
            PlayOutcome::Stopped {
                item_id: item.id.clone(),
            }
        } else {
            self.play(item).await
        }
    }

    pub fn snapshot(&self) -> VoicemailPlaybackState {
        let mut cached_items: Vec<String> = lock(&self.cache).keys().cloned().collect();
        cached_items.sort();

        let status = lock(&self.status);
        VoicemailPlaybackState {
            state: status.state,
            item_id: status.item_id.clone(),
            is_playing: status.state == PlaybackState::Playing,
            elapsed_seconds: status.elapsed,
            cached_items,
        }
    }

    /// Stop and release the output context.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(mut context) = lock(&self.context).take() {
            context.close();
        }
        if let Some(pump) = lock(&self.completion_pump).take() {
            pump.abort();
        }
        info!("Voicemail player shut down");
    }

    /// Create the output context on first use, resume it if suspended.
    fn ensure_context(&self) -> Result<(), PipelineError> {
        let mut slot = lock(&self.context);

        if slot.as_ref().map(|context| context.state() == ContextState::Closed).unwrap_or(true) {
            let mut context = self.device.open(self.sample_rate, self.channels)?;
            if let Some(completions) = context.take_completions() {
                let pump = self.spawn_completion_pump(completions);
                if let Some(previous) = lock(&self.completion_pump).replace(pump) {
                    previous.abort();
                }
            }
            *slot = Some(context);
        }

        if let Some(context) = slot.as_mut() {
            if context.state() == ContextState::Suspended {
                context.resume()?;
            }
        }
        Ok(())
    }

    fn spawn_completion_pump(&self, mut completions: tokio::sync::mpsc::UnboundedReceiver<SourceId>) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            while let Some(id) = completions.recv().await {
                let mut status = lock(&status);
                if status.source == Some(id) {
                    debug!(item = ?status.item_id, "Voicemail playback finished");
                    status.reset();
                }
            }
        })
    }

    fn spawn_ticker(&self, generation: u64) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut status = lock(&status);
                if status.generation != generation || status.state != PlaybackState::Playing {
                    break;
                }
                status.elapsed += 1;
            }
        })
    }

    fn fail(&self, generation: u64, item: &VoicemailEntry, error: PipelineError) -> PlayOutcome {
        let mut status = lock(&self.status);
        if status.generation == generation {
            status.reset();
        }
        drop(status);
        self.failed(item, error)
    }

    fn failed(&self, item: &VoicemailEntry, error: PipelineError) -> PlayOutcome {
        warn!(item = %item.id, kind = error.kind(), error = %error, "Voicemail playback failed");
        PlayOutcome::Failed {
            item_id: item.id.clone(),
            reason: error.to_string(),
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.completion_pump).take() {
            pump.abort();
        }
        if let Some(ticker) = lock(&self.status).ticker.take() {
            ticker.abort();
        }
    }
}
