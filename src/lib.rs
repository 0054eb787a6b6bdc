//! Voxlink - real-time duplex voice session library
//!
//! Captures live microphone audio, streams it to a remote speech model over
//! one persistent bidirectional channel, and schedules gapless playback of
//! the synthesized reply, including server-initiated interruption
//! (barge-in) and idempotent lifecycle teardown. Voxlink is an embedded
//! library: the presentation layer observes connection state and the
//! spectrum accessor, nothing more.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              VoiceSession (controller)               │
//! │     connect / disconnect / status / analyzer         │
//! └──────┬──────────────────┬───────────────────────────┘
//!        │                  │
//! ┌──────▼──────┐    ┌──────▼──────────────────────────┐
//! │   Capture   │    │        Session Transport         │
//! │ mic → frame ├───►│ encode → WebSocket ◄→ remote     │
//! └─────────────┘    └──────┬──────────────────────────┘
//!                           │
//! ┌─────────────┐    ┌──────▼──────────────────────────┐
//! │   Output    │◄───┤  decode → Playback Scheduler     │
//! │ mixer, clock│    │  (gapless, barge-in aware)       │
//! └─────────────┘    └─────────────────────────────────┘
//! ```
//!
//! Two independent unidirectional streams share one logical session:
//! microphone frames flow out, synthesized chunks flow back in and are
//! scheduled on the output device's own clock.

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

pub use audio::analyzer::{FFT_SIZE, FREQUENCY_BINS, SpectrumAnalyzer};
pub use audio::capture::{FRAME_SIZE, FrameSource};
pub use audio::pcm::{
    AudioBuffer, EncodedChunk, PLAYBACK_SAMPLE_RATE, decode_audio_data, encode_pcm,
};
pub use audio::playback::{
    AudioOutput, ManualClock, OUTPUT_SAMPLE_RATE, PlaybackClock, PlaybackScheduler, SampleClock,
};
pub use config::{DEFAULT_MODEL, DEFAULT_VOICE, Modality, SessionOptions};
pub use error::{Error, Result};
pub use session::{ConnectionState, SessionStatus, VoiceSession};
pub use transport::{LiveTransport, Transport, TransportEvent};
