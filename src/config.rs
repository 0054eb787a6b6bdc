//! Session configuration and credential resolution

use secrecy::SecretString;

use crate::{Error, Result};

/// Default remote model identifier for live duplex sessions
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice for synthesized replies
pub const DEFAULT_VOICE: &str = "Kore";

/// Requested response modality for the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    /// Synthesized speech audio
    Audio,
}

/// Options for opening a live voice session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Remote model identifier
    pub model: String,

    /// Persona / system instruction text, sent once at session open
    pub instruction: String,

    /// Prebuilt voice identifier for synthesized replies
    pub voice: String,

    /// Requested response modality
    pub modality: Modality,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            instruction: String::new(),
            voice: DEFAULT_VOICE.to_string(),
            modality: Modality::Audio,
        }
    }
}

/// Resolve the API key from the process environment
///
/// Checks `GEMINI_API_KEY` first, then `API_KEY`.
///
/// # Errors
///
/// Returns error if neither variable is set; a session cannot be opened
/// without a credential.
pub fn api_key_from_env() -> Result<SecretString> {
    std::env::var("GEMINI_API_KEY")
        .or_else(|_| std::env::var("API_KEY"))
        .map(SecretString::from)
        .map_err(|_| {
            Error::Config("API Key not found in environment (set GEMINI_API_KEY)".to_string())
        })
}
