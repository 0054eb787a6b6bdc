//! Error types for voxlink

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad options)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone capture error
    #[error("capture error: {0}")]
    Capture(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
