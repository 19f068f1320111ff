//! # Audio Buffers
//!
//! The two in-memory shapes audio takes inside the pipeline:
//!
//! - **AudioFrameBuffer**: one block of microphone samples, produced by a
//!   capture stream at a fixed processing interval and consumed immediately
//!   by the uplink encoder.
//! - **PlayableBuffer**: decoded downlink audio, ready to be scheduled on an
//!   output context.
//!
//! Both store samples channel-major (`channels[c][frame]`), normalized to
//! `[-1.0, 1.0]`.

/// Default number of frames per captured block (matches a 4096-sample
/// processing node).
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// A fixed-length block of captured samples.
///
/// ## Ownership:
/// Ephemeral. A capture stream moves each frame into a channel, the session
/// encodes it and the frame is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrameBuffer {
    /// Channel-major samples, every channel has the same length
    channels: Vec<Vec<f32>>,

    /// Sample rate the frame was captured at
    sample_rate: u32,

    /// Position of this frame in its capture stream (0, 1, 2, ...)
    sequence: u64,
}

impl AudioFrameBuffer {
    /// Build a frame from channel-major samples.
    ///
    /// Channels longer than the shortest one are truncated so the frame
    /// stays rectangular.
    pub fn new(mut channels: Vec<Vec<f32>>, sample_rate: u32, sequence: u64) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channels {
            channel.truncate(frames);
        }
        Self {
            channels,
            sample_rate,
            sequence,
        }
    }

    /// Convenience constructor for single-channel capture.
    pub fn mono(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self::new(vec![samples], sample_rate, sequence)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Samples of one channel, empty if the channel does not exist.
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Decoded audio ready for playback.
///
/// ## Calculations:
/// - **duration**: frame_count / sample_rate
/// - **peak**: largest absolute sample across all channels
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlayableBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// A buffer of `frames` zero samples.
    #[cfg(test)]
    pub fn silence(frames: usize, channel_count: usize, sample_rate: u32) -> Self {
        Self::new(vec![vec![0.0; frames]; channel_count.max(1)], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// The same audio laid out over `count` channels.
    ///
    /// Mono is copied into every channel. Anything else going to a different
    /// layout is mixed down first, so a stereo payload on a mono output keeps
    /// both sides. Frame count and duration never change.
    pub fn with_channel_count(self, count: u16) -> Self {
        let count = usize::from(count.max(1));
        if self.channels.len() == count || self.channels.is_empty() {
            return self;
        }
        let mono = self.mixdown();
        Self::new(vec![mono; count], self.sample_rate)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    #[cfg(test)]
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|channel| channel.iter())
            .fold(0.0f32, |peak, sample| peak.max(sample.abs()))
    }

    /// Average all channels into one. Recordings are mono, and so is any
    /// layout change that is not a plain copy of mono.
    pub fn mixdown(&self) -> Vec<f32> {
        let channels = self.channel_count();
        if channels <= 1 {
            return self.channel(0).to_vec();
        }
        (0..self.frame_count())
            .map(|frame| {
                let sum: f32 = self.channels.iter().map(|channel| channel[frame]).sum();
                sum / channels as f32
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_truncates_ragged_channels() {
        let frame = AudioFrameBuffer::new(vec![vec![0.1; 10], vec![0.2; 7]], 16000, 3);
        assert_eq!(frame.frame_count(), 7);
        assert_eq!(frame.channel(0).len(), 7);
        assert_eq!(frame.sequence(), 3);
        assert!(frame.channel(5).is_empty());
    }

    #[test]
    fn test_playable_duration_and_peak() {
        let buffer = PlayableBuffer::new(vec![vec![0.25, -0.75, 0.5, 0.0]], 4);
        assert_eq!(buffer.duration_secs(), 1.0);
        assert_eq!(buffer.peak(), 0.75);
    }

    #[test]
    fn test_mono_spreads_over_output_channels() {
        let mono = PlayableBuffer::new(vec![vec![0.1, 0.2, 0.3]], 3);
        let stereo = mono.clone().with_channel_count(2);
        assert_eq!(stereo.channel_count(), 2);
        assert_eq!(stereo.channel(0), mono.channel(0));
        assert_eq!(stereo.channel(1), mono.channel(0));
        assert_eq!(stereo.duration_secs(), 1.0);

        let folded = PlayableBuffer::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]], 2).with_channel_count(1);
        assert_eq!(folded.channel_count(), 1);
        assert_eq!(folded.channel(0), &[0.5, 0.5]);
    }

    #[test]
    fn test_mixdown_averages_channels() {
        let buffer = PlayableBuffer::new(vec![vec![1.0, 0.0], vec![0.0, -1.0]], 8000);
        assert_eq!(buffer.mixdown(), vec![0.5, -0.5]);
    }
}
