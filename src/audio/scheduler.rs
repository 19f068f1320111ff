//! # Downlink Scheduler
//!
//! Turns inbound audio chunks into gapless, order-preserving playback on one
//! output context.
//!
//! ## Cursor Protocol:
//! ```text
//! start  = max(cursor, context clock)
//! cursor = start + buffer duration
//! ```
//! Chunks arrive at irregular network intervals; chaining them through the
//! cursor makes them play back to back in arrival order with no overlap. If
//! the network falls behind, the clock overtakes the cursor and the next chunk
//! starts "now" instead of in the past.
//!
//! ## Rust Concepts:
//! - **Single owner**: the scheduler owns its context, cursor and source set.
//!   A session owns exactly one scheduler, so two calls never share a cursor.
//! - **Snapshot before cancel**: `ActiveSources::drain` takes the whole set out
//!   before anything is stopped, so cancellation never mutates while iterating.

use crate::audio::buffer::PlayableBuffer;
use crate::audio::codec::{self, EncodedAudioChunk};
use crate::audio::output::{ContextState, OutputContext, SourceId};
use crate::error::PipelineError;
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// "When the next buffer should begin", in context seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    position: f64,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Reserve `duration` seconds of playback and return the start time.
    pub fn reserve(&mut self, now: f64, duration: f64) -> f64 {
        let start = self.position.max(now);
        self.position = start + duration.max(0.0);
        start
    }

    /// Forget queued time. Only used when playback is cut off.
    pub fn reset(&mut self) {
        self.position = 0.0;
    }
}

/// Sources scheduled on a context that have not ended yet.
#[derive(Debug, Default)]
pub struct ActiveSources {
    sources: HashSet<SourceId>,
}

impl ActiveSources {
    pub fn insert(&mut self, id: SourceId) {
        self.sources.insert(id);
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        self.sources.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Take every id out of the set, leaving it empty.
    pub fn drain(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.sources).into_iter().collect()
    }
}

/// Where a chunk landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledChunk {
    pub source: SourceId,
    pub start: f64,
    pub duration: f64,
}

/// One session's downlink: output context, cursor and active sources.
pub struct DownlinkScheduler {
    context: Box<dyn OutputContext>,
    cursor: PlaybackCursor,
    active: ActiveSources,
    closed: bool,
}

impl DownlinkScheduler {
    pub fn new(context: Box<dyn OutputContext>) -> Self {
        Self {
            context,
            cursor: PlaybackCursor::new(),
            active: ActiveSources::default(),
            closed: false,
        }
    }

    /// Completion channel of the underlying context. Available once.
    pub fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
        self.context.take_completions()
    }

    /// Decode a chunk and queue it behind everything already scheduled.
    ///
    /// Chunks without a `rate=` in their mime type are assumed to be at the
    /// context's own rate. The payload keeps its own channel layout; the
    /// context fits it to the output.
    pub fn schedule(&mut self, chunk: &EncodedAudioChunk) -> Result<ScheduledChunk, PipelineError> {
        if self.closed {
            return Err(PipelineError::InvalidState("downlink is closed".to_string()));
        }
        let buffer = codec::decode_chunk(chunk, self.context.sample_rate())?;
        self.schedule_buffer(buffer)
    }

    pub fn schedule_buffer(&mut self, buffer: PlayableBuffer) -> Result<ScheduledChunk, PipelineError> {
        if self.closed {
            return Err(PipelineError::InvalidState("downlink is closed".to_string()));
        }

        let duration = buffer.duration_secs();
        let now = self.context.current_time();
        let start = self.cursor.reserve(now, duration);
        let source = self.context.start_source(buffer, start)?;
        self.active.insert(source);

        trace!(source, start, duration, cursor = self.cursor.position(), "Scheduled downlink audio");
        Ok(ScheduledChunk { source, start, duration })
    }

    /// A source finished on its own.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(id)
    }

    /// Stop everything that is playing or queued. Returns how many sources
    /// were cancelled.
    pub fn stop_all(&mut self) -> usize {
        let ids = self.active.drain();
        for &id in &ids {
            // already-finished sources are fine, the context just says no
            self.context.stop_source(id);
        }
        ids.len()
    }

    /// Barge-in: drop queued audio so the next chunk starts immediately.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.cursor.reset();
        debug!(stopped, "Downlink interrupted");
        stopped
    }

    /// Stop all sources and release the context. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let stopped = self.stop_all();
        self.context.close();
        self.closed = true;
        debug!(stopped, "Downlink closed");
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed || self.context.state() == ContextState::Closed
    }
}

impl Drop for DownlinkScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
