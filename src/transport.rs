//! Session transport
//!
//! Owns the single logical connection to the remote service: routes encoded
//! microphone audio out and server messages in. Events are delivered to the
//! session controller through a tagged channel; the submit path is resilient
//! to races with teardown and decides suppression from explicit transport
//! state, never from error-message text.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::audio::pcm::EncodedChunk;
use crate::config::{Modality, SessionOptions};
use crate::{Error, Result};

/// Live API WebSocket endpoint
const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound queue depth before frames are dropped
const OUTBOUND_QUEUE: usize = 64;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Events surfaced by the transport to the session controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The remote service acknowledged the session open
    Opened,
    /// A base64 PCM audio chunk from the server
    Audio {
        /// Base64-encoded 16-bit PCM payload
        data: String,
    },
    /// The server cancelled its in-progress reply (barge-in)
    Interrupted,
    /// The model finished a reply turn
    TurnComplete,
    /// The server or network ended the session
    Closed,
    /// Transport-level failure
    Error(String),
}

/// Duplex channel to the remote service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit an encoded frame for transmission
    ///
    /// Submissions that race with teardown are discarded silently; other
    /// failures are logged and never surfaced, since a single dropped frame
    /// does not warrant session termination.
    async fn send_audio(&self, chunk: EncodedChunk);

    /// Request the connection be closed (idempotent, fire-and-forget)
    async fn close(&self);
}

// ── Outbound wire types ──────────────────────────────────────────

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [Modality; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
struct RealtimeInput {
    media: MediaBlob,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaBlob {
    data: String,
    mime_type: String,
}

// ── Inbound wire types ───────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    interrupted: Option<bool>,
    turn_complete: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: String,
}

/// Build the one-time setup payload sent at session open
fn setup_json(options: &SessionOptions) -> serde_json::Result<String> {
    serde_json::to_string(&SetupMessage {
        setup: Setup {
            model: format!("models/{}", options.model),
            generation_config: GenerationConfig {
                response_modalities: [options.modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &options.voice,
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart {
                    text: &options.instruction,
                }],
            },
        },
    })
}

/// Build the per-frame realtime input payload
fn realtime_input_json(chunk: &EncodedChunk) -> serde_json::Result<String> {
    serde_json::to_string(&RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media: MediaBlob {
                data: base64::engine::general_purpose::STANDARD.encode(&chunk.data),
                mime_type: chunk.mime_type(),
            },
        },
    })
}

/// Translate one server message into transport events
///
/// Unparseable messages are dropped with a warning; the session continues.
fn parse_server_message(text: &str) -> Vec<TransportEvent> {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable server message dropped");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }
    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    events.push(TransportEvent::Audio { data: inline.data });
                }
            }
        }
        if content.interrupted.unwrap_or(false) {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete.unwrap_or(false) {
            events.push(TransportEvent::TurnComplete);
        }
    }
    events
}

/// WebSocket transport to the live speech service
pub struct LiveTransport {
    outbound: mpsc::Sender<Message>,
    closing: Arc<AtomicBool>,
}

impl LiveTransport {
    /// Open the connection, send the setup message, and spawn the reader
    /// and writer tasks
    ///
    /// # Errors
    ///
    /// Returns error if the WebSocket handshake or the setup send fails.
    pub async fn connect(
        options: &SessionOptions,
        api_key: &SecretString,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let url = format!("{LIVE_ENDPOINT}?key={}", api_key.expose_secret());
        let (stream, _response) = connect_async(url.as_str()).await?;
        tracing::debug!(model = %options.model, "live channel established");

        let (mut sink, source) = stream.split();
        sink.send(Message::Text(setup_json(options)?))
            .await
            .map_err(|e| Error::Transport(format!("setup send failed: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&closing)));
        tokio::spawn(read_loop(source, event_tx, Arc::clone(&closing)));

        Ok((
            Self {
                outbound: outbound_tx,
                closing,
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn send_audio(&self, chunk: EncodedChunk) {
        // Explicit state check: submissions racing with teardown are
        // expected and discarded without logging.
        if self.closing.load(Ordering::Acquire) {
            return;
        }

        let text = match realtime_input_json(&chunk) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode audio frame");
                return;
            }
        };

        match self.outbound.try_send(Message::Text(text)) {
            Ok(()) => {}
            // Writer task ended: another teardown race, stay silent.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Real-time audio has no redelivery value.
                tracing::warn!("outbound queue full, dropping frame");
            }
        }
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        // Nudge the writer so it observes the flag and sends the close
        // frame; failure means it is already gone.
        let _ = self.outbound.try_send(Message::Close(None));
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Message>,
    closing: Arc<AtomicBool>,
) {
    while let Some(message) = outbound.recv().await {
        if closing.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = sink.send(message).await {
            if closing.load(Ordering::Acquire) {
                break;
            }
            tracing::warn!(error = %e, "failed to send audio frame");
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
    tracing::debug!("transport writer finished");
}

async fn read_loop(
    mut source: WsSource,
    events: mpsc::Sender<TransportEvent>,
    closing: Arc<AtomicBool>,
) {
    let mut failed = false;
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                for event in parse_server_message(&text) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            // The live API also delivers JSON payloads as binary frames.
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    for event in parse_server_message(&text) {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => tracing::warn!("non-UTF-8 binary frame dropped"),
            },
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "server closed the session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    tracing::debug!(error = %e, "read error during teardown ignored");
                } else {
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    failed = true;
                }
                break;
            }
        }
    }
    if !failed {
        let _ = events.send(TransportEvent::Closed).await;
    }
}
