//! # Audio Pipeline
//!
//! Everything between the microphone and the speaker of a voice call.
//!
//! ## Key Components:
//! - **buffer**: captured frames and decoded, playable buffers
//! - **codec**: float/PCM16/base64 conversions and the encoded chunk type
//! - **capture**: microphone devices producing fixed-size frames
//! - **output**: output contexts with a monotonic clock and scheduled sources
//! - **scheduler**: gapless downlink scheduling on one output context
//! - **session**: the streaming call orchestrator and its registry
//!
//! ## Audio Formats:
//! - **Uplink**: 16 kHz mono, 16-bit little-endian PCM, base64 encoded
//! - **Downlink**: 24 kHz mono, same encoding; the mime type carries the rate

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod output;
pub mod scheduler;
pub mod session;
