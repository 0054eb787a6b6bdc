//! Audio pipeline
//!
//! PCM wire codecs, microphone capture, playback scheduling, and the
//! output spectrum accessor.

pub mod analyzer;
pub mod capture;
pub mod pcm;
pub mod playback;

pub use analyzer::{FFT_SIZE, FREQUENCY_BINS, SpectrumAnalyzer};
pub use capture::{FRAME_SIZE, FrameSource, open_frame_source};
pub use pcm::{AudioBuffer, EncodedChunk, PLAYBACK_SAMPLE_RATE, decode_audio_data, encode_pcm};
pub use playback::{
    AudioOutput, ManualClock, OUTPUT_SAMPLE_RATE, PlaybackClock, PlaybackScheduler, SampleClock,
};
