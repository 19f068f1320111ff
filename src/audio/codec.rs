//! # Audio Codec Utilities
//!
//! Conversions between base64 text, raw bytes, 16-bit PCM and normalized
//! floating-point buffers. These are the leaves of the pipeline: the uplink
//! encoder and the downlink decoder are built entirely from them.
//!
//! ## Wire Format:
//! - **Encoding**: signed 16-bit little-endian PCM
//! - **Transport**: standard base64 (padded)
//! - **Mime type**: `audio/pcm;rate=<sample rate>`

use crate::audio::buffer::PlayableBuffer;
use crate::error::PipelineError;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Scale between i16 PCM and normalized floats.
const PCM_SCALE: f32 = 32768.0;

/// One base64 PCM payload plus its mime type.
///
/// Serialized with camelCase keys (`mimeType`) because that is the shape the
/// conversational service exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudioChunk {
    pub data: String,
    pub mime_type: String,
}

impl EncodedAudioChunk {
    pub fn new(data: String, mime_type: String) -> Self {
        Self { data, mime_type }
    }

    /// Sample rate declared in the mime type, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        mime_param(&self.mime_type, "rate")
    }

    /// Interleaved channels declared in the mime type. PCM without a
    /// `channels=` parameter is mono.
    pub fn channel_count(&self) -> u16 {
        mime_param(&self.mime_type, "channels").filter(|&count| count > 0).unwrap_or(1)
    }
}

/// How out-of-range floats are turned into 16-bit samples.
///
/// - **Clamp**: saturate to `[-32768, 32767]`
/// - **Wrap**: truncate then wrap modulo 2^16, the way a typed-array store
///   behaves; `1.0` becomes `-32768`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleConversion {
    #[default]
    Clamp,
    Wrap,
}

impl std::str::FromStr for SampleConversion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clamp" | "clip" => Ok(SampleConversion::Clamp),
            "wrap" => Ok(SampleConversion::Wrap),
            _ => Err(format!("Unknown sample conversion policy: {}", s)),
        }
    }
}

/// Build the mime type tag for PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Parse a numeric parameter out of a mime type such as
/// `audio/L16;codec=pcm;rate=24000`.
fn mime_param<T: std::str::FromStr>(mime_type: &str, name: &str) -> Option<T> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Standard base64 decode.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, PipelineError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(text.trim())?)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Turn raw 16-bit LE PCM bytes into a channel-major float buffer.
///
/// ## Edge Cases:
/// - **Odd length**: the trailing byte is dropped, never an error
/// - **Incomplete frame**: samples that do not fill a whole multi-channel
///   frame are dropped
/// - **Zero channels**: treated as mono
pub fn bytes_to_playable_buffer(bytes: &[u8], sample_rate: u32, channel_count: u16) -> PlayableBuffer {
    let channels = usize::from(channel_count.max(1));
    let usable = bytes.len() - bytes.len() % 2;
    let total_samples = usable / 2;
    let frames = total_samples / channels;

    let mut data = vec![Vec::with_capacity(frames); channels];
    for frame in 0..frames {
        for (channel, samples) in data.iter_mut().enumerate() {
            let offset = (frame * channels + channel) * 2;
            let value = LittleEndian::read_i16(&bytes[offset..offset + 2]);
            samples.push(f32::from(value) / PCM_SCALE);
        }
    }

    PlayableBuffer::new(data, sample_rate)
}

/// Convert one normalized float sample into a 16-bit PCM sample.
pub fn float_to_pcm16(sample: f32, conversion: SampleConversion) -> i16 {
    let scaled = sample * PCM_SCALE;
    match conversion {
        // `as i16` on a float saturates and maps NaN to 0
        SampleConversion::Clamp => scaled as i16,
        // truncate toward zero, then keep the low 16 bits
        SampleConversion::Wrap => (scaled as i64) as i16,
    }
}

/// Encode a captured float frame as a base64 PCM chunk.
pub fn encode_float_frame(samples: &[f32], sample_rate: u32, conversion: SampleConversion) -> EncodedAudioChunk {
    let mut bytes = vec![0u8; samples.len() * 2];
    for (index, &sample) in samples.iter().enumerate() {
        LittleEndian::write_i16(&mut bytes[index * 2..index * 2 + 2], float_to_pcm16(sample, conversion));
    }
    EncodedAudioChunk::new(encode_base64(&bytes), pcm_mime_type(sample_rate))
}

/// Decode an inbound chunk.
///
/// The payload layout comes from the chunk itself: `rate=` from its mime type
/// or `fallback_rate`, and `channels=` or mono. Fitting the result to an
/// output layout is the output context's job.
pub fn decode_chunk(chunk: &EncodedAudioChunk, fallback_rate: u32) -> Result<PlayableBuffer, PipelineError> {
    let bytes = decode_base64(&chunk.data)?;
    let rate = chunk.sample_rate().unwrap_or(fallback_rate);
    Ok(bytes_to_playable_buffer(&bytes, rate, chunk.channel_count()))
}
