//! PCM wire codecs
//!
//! Microphone frames go out as linear 16-bit little-endian PCM tagged with
//! the true capture rate; server chunks come back as base64 PCM at a fixed
//! synthesis rate.

use base64::Engine as _;

use crate::{Error, Result};

/// Sample rate of synthesized audio from the server (Hz)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A frame of microphone audio encoded for transmission
///
/// Sent once; real-time audio has no redelivery value, so a dropped chunk
/// is never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Linear 16-bit PCM, little-endian, mono
    pub data: Vec<u8>,

    /// Sample rate the frame was captured at
    pub sample_rate: u32,
}

impl EncodedChunk {
    /// MIME descriptor declaring the true capture rate
    ///
    /// Capture devices choose their own native rate; the remote service
    /// needs the real one to resample correctly.
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Decoded audio ready for playback scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples in [-1.0, 1.0], mono
    pub samples: Vec<f32>,

    /// Playback sample rate
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Duration of the buffer in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Encode a frame of f32 samples as 16-bit little-endian PCM
///
/// Samples are clamped to [-1.0, 1.0] before scaling so out-of-range input
/// cannot overflow. An empty frame yields an empty chunk, not an error.
#[must_use]
pub fn encode_pcm(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    EncodedChunk { data, sample_rate }
}

/// Decode a base64 PCM payload from the server into a playable buffer
///
/// Decode calls have no ordering dependency on each other; playback order
/// is enforced by the scheduler, not by decode completion order.
///
/// # Errors
///
/// Returns error if the payload is not valid base64. Truncated payloads
/// are not an error: a trailing odd byte is ignored and an empty payload
/// yields a zero-length buffer.
pub fn decode_audio_data(data: &str, sample_rate: u32) -> Result<AudioBuffer> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Audio(format!("invalid base64 payload: {e}")))?;
    Ok(decode_pcm(&bytes, sample_rate))
}

/// Reconstruct f32 samples from raw 16-bit little-endian PCM bytes
#[must_use]
pub fn decode_pcm(bytes: &[u8], sample_rate: u32) -> AudioBuffer {
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();
    AudioBuffer {
        samples,
        sample_rate,
    }
}
