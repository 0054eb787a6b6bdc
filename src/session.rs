//! Session lifecycle controller
//!
//! The top-level state machine coordinating capture, playback, and
//! transport: connect, disconnect, error, and interruption transitions with
//! idempotent teardown. At most one logical session exists per controller
//! at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::analyzer::SpectrumAnalyzer;
use crate::audio::capture::{self, FrameReceiver, FrameSource};
use crate::audio::pcm::{self, PLAYBACK_SAMPLE_RATE};
use crate::audio::playback::{AudioOutput, PlaybackScheduler, new_inflight_set};
use crate::config::{self, SessionOptions};
use crate::transport::{LiveTransport, Transport, TransportEvent};
use crate::Result;

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; the idle state
    #[default]
    Disconnected,
    /// Devices and transport are being opened
    Connecting,
    /// The remote service acknowledged the session
    Connected,
    /// A setup or transport failure ended the session
    Error,
}

/// Observable status: state plus an optional human-readable error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Set when `state` is [`ConnectionState::Error`]
    pub error: Option<String>,
}

/// The duplex voice session controller
///
/// `connect` tears down any previous session before opening a new one;
/// `disconnect` is idempotent and safe to call concurrently with in-flight
/// async work. Dropping the controller tears the session down.
pub struct VoiceSession {
    options: SessionOptions,
    active: Arc<AtomicBool>,
    status: watch::Sender<SessionStatus>,
    scheduler: Option<Arc<Mutex<PlaybackScheduler>>>,
    transport: Option<Arc<dyn Transport>>,
    capture: Option<Box<dyn FrameSource>>,
    output: Option<AudioOutput>,
    analyzer: Option<SpectrumAnalyzer>,
    pump: Option<JoinHandle<()>>,
}

impl VoiceSession {
    /// Create a controller in the disconnected state
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            options,
            active: Arc::new(AtomicBool::new(false)),
            status,
            scheduler: None,
            transport: None,
            capture: None,
            output: None,
            analyzer: None,
            pump: None,
        }
    }

    /// Observable connection status for the presentation layer
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Read-only frequency-data accessor driving the visualizer
    ///
    /// `None` between sessions.
    #[must_use]
    pub fn analyzer(&self) -> Option<SpectrumAnalyzer> {
        self.analyzer.clone()
    }

    /// Whether the session is currently forwarding audio
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Open a new duplex session
    ///
    /// Any previous session is torn down first. On failure the controller
    /// is left in the `Error` state with a human-readable message and every
    /// resource released.
    ///
    /// # Errors
    ///
    /// Returns setup errors: missing credential, no usable audio devices,
    /// or a failed WebSocket handshake.
    pub async fn connect(&mut self) -> Result<()> {
        self.teardown();
        self.set_status(ConnectionState::Connecting, None);

        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "failed to open session");
                self.teardown();
                self.set_status(ConnectionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        // Credential first: without it nothing else should be touched.
        let api_key = config::api_key_from_env()?;

        // Output side: device, clock, scheduler, analyzer.
        let analyzer = SpectrumAnalyzer::new();
        let inflight = new_inflight_set();
        let output = AudioOutput::open(Arc::clone(&inflight), analyzer.clone())?;
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::with_items(
            output.clock(),
            inflight,
        )));

        // Input side: probed frame source at the device's native rate.
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let capture = capture::open_frame_source(Arc::clone(&self.active), frame_tx)?;
        let capture_rate = capture.sample_rate();
        tracing::info!(sample_rate = capture_rate, "microphone capture running");

        let (transport, events) = LiveTransport::connect(&self.options, &api_key).await?;
        let transport: Arc<dyn Transport> = Arc::new(transport);

        self.pump = Some(tokio::spawn(run_session(
            Arc::clone(&self.active),
            self.status.clone(),
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            frame_rx,
            events,
            capture_rate,
        )));

        self.analyzer = Some(analyzer);
        self.scheduler = Some(scheduler);
        self.transport = Some(transport);
        self.capture = Some(capture);
        self.output = Some(output);
        Ok(())
    }

    /// Tear down the session and return to the disconnected state
    ///
    /// Idempotent: callable from any state, including before a session ever
    /// opened, and twice in a row.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.set_status(ConnectionState::Disconnected, None);
    }

    /// Release every session resource, in dependency order: stop data
    /// production and consumption before tearing down the transport and
    /// devices.
    fn teardown(&mut self) {
        // Flag first so concurrent capture callbacks and decode
        // continuations short-circuit.
        self.active.store(false, Ordering::Release);

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        // 1. Stop playback and capture.
        if let Some(scheduler) = self.scheduler.take() {
            if let Ok(mut scheduler) = scheduler.lock() {
                scheduler.clear();
            }
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        // 2. Close the transport, fire-and-forget; close errors are
        // swallowed. Without a runtime (teardown from Drop outside async
        // context) dropping the handle closes the outbound channel, which
        // ends the writer the same way.
        if let Some(transport) = self.transport.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { transport.close().await });
            }
        }

        // 3. Release the output device and the visualizer handle.
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        if let Some(analyzer) = self.analyzer.take() {
            analyzer.reset();
        }
    }

    fn set_status(&self, state: ConnectionState, error: Option<String>) {
        self.status.send_replace(SessionStatus { state, error });
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The single control loop: forwards capture frames out and routes server
/// events into the playback scheduler
async fn run_session(
    active: Arc<AtomicBool>,
    status: watch::Sender<SessionStatus>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    mut frames: FrameReceiver,
    mut events: mpsc::Receiver<TransportEvent>,
    capture_rate: u32,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                // Re-check before acting: frames can race with teardown.
                if !active.load(Ordering::Acquire) {
                    continue;
                }
                transport.send_audio(pcm::encode_pcm(&frame, capture_rate)).await;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !handle_event(event, &active, &status, &scheduler) {
                    break;
                }
            }
        }
    }
    tracing::debug!("session loop finished");
}

/// Apply one transport event; returns false when the loop should end
fn handle_event(
    event: TransportEvent,
    active: &AtomicBool,
    status: &watch::Sender<SessionStatus>,
    scheduler: &Mutex<PlaybackScheduler>,
) -> bool {
    match event {
        TransportEvent::Opened => {
            tracing::info!("session opened");
            active.store(true, Ordering::Release);
            status.send_replace(SessionStatus {
                state: ConnectionState::Connected,
                error: None,
            });
            true
        }
        TransportEvent::Audio { data } => {
            if !active.load(Ordering::Acquire) {
                // Late chunk after teardown: silent no-op.
                return true;
            }
            match pcm::decode_audio_data(&data, PLAYBACK_SAMPLE_RATE) {
                Ok(buffer) => {
                    if let Ok(mut scheduler) = scheduler.lock() {
                        scheduler.schedule(buffer);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "undecodable audio chunk dropped"),
            }
            true
        }
        TransportEvent::Interrupted => {
            tracing::debug!("server interrupted its reply");
            if let Ok(mut scheduler) = scheduler.lock() {
                scheduler.interrupt();
            }
            true
        }
        TransportEvent::TurnComplete => {
            tracing::trace!("model turn complete");
            true
        }
        TransportEvent::Closed => {
            let state = status.borrow().state;
            let was_live = active.swap(false, Ordering::AcqRel);
            // Only a close the controller did not itself request changes
            // state; teardown-induced closes stay silent.
            if was_live || state == ConnectionState::Connecting {
                tracing::info!("session closed by remote");
                if let Ok(mut scheduler) = scheduler.lock() {
                    scheduler.clear();
                }
                status.send_replace(SessionStatus {
                    state: ConnectionState::Disconnected,
                    error: None,
                });
            }
            false
        }
        TransportEvent::Error(message) => {
            let state = status.borrow().state;
            let was_live = active.swap(false, Ordering::AcqRel);
            if was_live || state == ConnectionState::Connecting {
                tracing::error!(error = %message, "session transport failed");
                if let Ok(mut scheduler) = scheduler.lock() {
                    scheduler.clear();
                }
                status.send_replace(SessionStatus {
                    state: ConnectionState::Error,
                    error: Some(format!("Connection lost: {message}")),
                });
            } else {
                tracing::debug!(error = %message, "transport error after teardown ignored");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use base64::Engine as _;

    use crate::audio::pcm::{EncodedChunk, encode_pcm};
    use crate::audio::playback::ManualClock;

    /// Transport spy capturing submitted chunks
    #[derive(Default)]
    struct SpyTransport {
        sent: Mutex<Vec<EncodedChunk>>,
        closed: AtomicBool,
    }

    impl SpyTransport {
        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Transport for SpyTransport {
        async fn send_audio(&self, chunk: EncodedChunk) {
            self.sent.lock().unwrap().push(chunk);
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    struct Harness {
        active: Arc<AtomicBool>,
        status: watch::Sender<SessionStatus>,
        transport: Arc<SpyTransport>,
        scheduler: Arc<Mutex<PlaybackScheduler>>,
        frame_tx: mpsc::UnboundedSender<Vec<f32>>,
        event_tx: mpsc::Sender<TransportEvent>,
        pump: JoinHandle<()>,
    }

    fn spawn_harness() -> Harness {
        let active = Arc::new(AtomicBool::new(false));
        let (status, _) = watch::channel(SessionStatus {
            state: ConnectionState::Connecting,
            error: None,
        });
        let transport = Arc::new(SpyTransport::default());
        let clock = Arc::new(ManualClock::new());
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(clock)));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(16);

        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let pump = tokio::spawn(run_session(
            Arc::clone(&active),
            status.clone(),
            transport_dyn,
            Arc::clone(&scheduler),
            frame_rx,
            event_rx,
            48_000,
        ));

        Harness {
            active,
            status,
            transport,
            scheduler,
            frame_tx,
            event_tx,
            pump,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_frames_before_open_are_dropped() {
        let harness = spawn_harness();

        harness.frame_tx.send(vec![0.1; 64]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.transport.sent_count(), 0);

        harness.pump.abort();
    }

    #[tokio::test]
    async fn test_frames_after_teardown_are_never_transmitted() {
        let harness = spawn_harness();

        harness.event_tx.send(TransportEvent::Opened).await.unwrap();
        wait_until(|| harness.active.load(Ordering::Acquire)).await;
        assert_eq!(harness.status.borrow().state, ConnectionState::Connected);

        harness.frame_tx.send(vec![0.1; 64]).unwrap();
        wait_until(|| harness.transport.sent_count() == 1).await;

        // Remote close begins teardown; frames still arriving concurrently
        // must never reach the transport.
        harness.event_tx.send(TransportEvent::Closed).await.unwrap();
        wait_until(|| !harness.active.load(Ordering::Acquire)).await;

        harness.frame_tx.send(vec![0.2; 64]).unwrap();
        harness.frame_tx.send(vec![0.3; 64]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.transport.sent_count(), 1);
        assert_eq!(harness.status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_one_chunk_then_barge_in() {
        let harness = spawn_harness();

        harness.event_tx.send(TransportEvent::Opened).await.unwrap();
        wait_until(|| harness.active.load(Ordering::Acquire)).await;

        // One 0.5 s chunk at the synthesis rate.
        let samples = vec![0.25; 12_000];
        let chunk = encode_pcm(&samples, PLAYBACK_SAMPLE_RATE);
        let data = base64::engine::general_purpose::STANDARD.encode(&chunk.data);
        harness
            .event_tx
            .send(TransportEvent::Audio { data })
            .await
            .unwrap();

        wait_until(|| harness.scheduler.lock().unwrap().in_flight() == 1).await;
        {
            let scheduler = harness.scheduler.lock().unwrap();
            assert!((scheduler.next_start_time() - 0.5).abs() < 1e-9);
        }

        harness
            .event_tx
            .send(TransportEvent::Interrupted)
            .await
            .unwrap();
        wait_until(|| harness.scheduler.lock().unwrap().in_flight() == 0).await;
        {
            let scheduler = harness.scheduler.lock().unwrap();
            assert!((scheduler.next_start_time() - 0.0).abs() < f64::EPSILON);
        }

        harness.pump.abort();
    }

    #[tokio::test]
    async fn test_transport_error_while_live_sets_error_state() {
        let harness = spawn_harness();

        harness.event_tx.send(TransportEvent::Opened).await.unwrap();
        wait_until(|| harness.active.load(Ordering::Acquire)).await;

        harness
            .event_tx
            .send(TransportEvent::Error("socket reset".to_string()))
            .await
            .unwrap();
        wait_until(|| !harness.active.load(Ordering::Acquire)).await;

        let status = harness.status.borrow().clone();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap().contains("socket reset"));
    }

    #[tokio::test]
    async fn test_late_audio_after_teardown_is_ignored() {
        let harness = spawn_harness();

        harness.event_tx.send(TransportEvent::Opened).await.unwrap();
        wait_until(|| harness.active.load(Ordering::Acquire)).await;

        // Teardown from the controller side.
        harness.active.store(false, Ordering::Release);

        let chunk = encode_pcm(&[0.5; 64], PLAYBACK_SAMPLE_RATE);
        let data = base64::engine::general_purpose::STANDARD.encode(&chunk.data);
        harness
            .event_tx
            .send(TransportEvent::Audio { data })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.scheduler.lock().unwrap().in_flight(), 0);

        harness.pump.abort();
    }

    #[test]
    fn test_disconnect_is_idempotent_when_never_connected() {
        let mut session = VoiceSession::new(SessionOptions::default());
        session.disconnect();
        session.disconnect();

        assert_eq!(session.status().borrow().state, ConnectionState::Disconnected);
        assert!(!session.is_active());
        assert!(session.analyzer().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_credential_sets_error_state() {
        // Runs only in environments without a real key; mutating the
        // process environment would race other tests.
        if config::api_key_from_env().is_ok() {
            return;
        }

        let mut session = VoiceSession::new(SessionOptions::default());
        let err = session.connect().await.unwrap_err();
        assert!(err.to_string().contains("API Key"));

        let status = session.status().borrow().clone();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap().contains("API Key"));
        assert!(!session.is_active());
    }
}
