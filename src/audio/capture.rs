//! Microphone capture pipeline
//!
//! Acquires the default input device and forwards fixed-size mono frames to
//! the session loop without blocking the real-time audio thread. Two
//! interchangeable frame sources exist: [`StreamSource`] assembles frames
//! inside the stream callback itself, [`PolledSource`] drains a shared
//! buffer from a helper thread. [`open_frame_source`] probes for the
//! preferred one and falls back, so call sites never branch on the
//! mechanism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Samples per captured frame
pub const FRAME_SIZE: usize = 4096;

/// Drain interval for the polled fallback source
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sending half of the capture frame channel
pub type FrameSender = mpsc::UnboundedSender<Vec<f32>>;

/// Receiving half of the capture frame channel
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<f32>>;

/// A running source of fixed-size microphone frames
///
/// Frames are forwarded in capture order and dropped (never reordered)
/// once the session `active` flag goes false.
pub trait FrameSource: Send {
    /// Native sample rate of the underlying device
    fn sample_rate(&self) -> u32;

    /// Stop capturing and release the device (idempotent)
    fn stop(&mut self);
}

/// Accumulates mono samples into fixed-size frames
struct Framer {
    buffer: Vec<f32>,
    channels: usize,
}

impl Framer {
    fn new(channels: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_SIZE),
            channels: channels.max(1),
        }
    }

    /// Downmix interleaved input to mono and emit every completed frame
    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, data: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        for frame in data.chunks(self.channels) {
            let sample = frame.iter().sum::<f32>() / frame.len() as f32;
            self.buffer.push(sample);
            if self.buffer.len() >= FRAME_SIZE {
                emit(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(FRAME_SIZE),
                ));
            }
        }
    }
}

/// Open the default input device at its native configuration
///
/// The device's own rate is kept (never forced): the encoder tags each
/// chunk with the true rate so the remote service can resample.
fn open_input_device() -> Result<(cpal::Device, cpal::StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Capture("no input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Capture(e.to_string()))?;
    let config = supported.config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "input device opened"
    );

    Ok((device, config))
}

/// Shared shutdown plumbing for both source variants
struct CaptureThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureThread {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!("capture stopped");
        }
    }
}

/// Frame source that assembles frames inside the real-time stream callback
///
/// The preferred mechanism: framing happens in the capture context itself
/// and completed frames are forwarded directly through the channel, which
/// never blocks.
pub struct StreamSource {
    sample_rate: u32,
    inner: CaptureThread,
}

impl StreamSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or the stream fails to
    /// start.
    pub fn open(active: Arc<AtomicBool>, frames: FrameSender) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let stream = match build_framing_stream(&active, frames) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(stream.1));
            // Hold the stream alive until stop is requested.
            let _ = stop_rx.recv();
            drop(stream);
        });

        let sample_rate = recv_ready(&ready_rx)?;
        Ok(Self {
            sample_rate,
            inner: CaptureThread {
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        })
    }
}

impl FrameSource for StreamSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

fn build_framing_stream(
    active: &Arc<AtomicBool>,
    frames: FrameSender,
) -> Result<(cpal::Stream, u32)> {
    let (device, config) = open_input_device()?;
    let sample_rate = config.sample_rate.0;
    let mut framer = Framer::new(config.channels as usize);
    let active = Arc::clone(active);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                framer.push(data, |frame| {
                    // Primary cutoff: frames after teardown are dropped
                    // silently, never forwarded.
                    if active.load(Ordering::Acquire) {
                        let _ = frames.send(frame);
                    }
                });
            },
            |err| {
                tracing::error!(error = %err, "input stream error");
            },
            None,
        )
        .map_err(|e| Error::Capture(e.to_string()))?;

    stream.play().map_err(|e| Error::Capture(e.to_string()))?;
    Ok((stream, sample_rate))
}

/// Frame source that drains a shared buffer on a fixed tick
///
/// The fallback mechanism: the stream callback only appends to a shared
/// buffer; a helper thread assembles the same fixed-size frames. Output is
/// functionally identical to [`StreamSource`].
pub struct PolledSource {
    sample_rate: u32,
    inner: CaptureThread,
}

impl PolledSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or the stream fails to
    /// start.
    pub fn open(active: Arc<AtomicBool>, frames: FrameSender) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let built = open_input_device().and_then(|(device, config)| {
                let buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
                let writer = Arc::clone(&buffer);
                let stream = device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if let Ok(mut buf) = writer.lock() {
                                buf.extend_from_slice(data);
                            }
                        },
                        |err| {
                            tracing::error!(error = %err, "input stream error");
                        },
                        None,
                    )
                    .map_err(|e| Error::Capture(e.to_string()))?;
                stream.play().map_err(|e| Error::Capture(e.to_string()))?;
                Ok((stream, config, buffer))
            });

            let (stream, config, buffer) = match built {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(config.sample_rate.0));

            let mut framer = Framer::new(config.channels as usize);
            loop {
                match stop_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {
                        let pending = buffer
                            .lock()
                            .map(|mut buf| std::mem::take(&mut *buf))
                            .unwrap_or_default();
                        framer.push(&pending, |frame| {
                            if active.load(Ordering::Acquire) {
                                let _ = frames.send(frame);
                            }
                        });
                    }
                }
            }
            drop(stream);
        });

        let sample_rate = recv_ready(&ready_rx)?;
        Ok(Self {
            sample_rate,
            inner: CaptureThread {
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        })
    }
}

impl FrameSource for PolledSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

impl Drop for PolledSource {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

fn recv_ready(ready: &std_mpsc::Receiver<Result<u32>>) -> Result<u32> {
    ready
        .recv()
        .map_err(|_| Error::Capture("capture thread exited before reporting".to_string()))?
}

/// Probe for the preferred frame source, falling back to the polled variant
///
/// Both variants produce identical fixed-size frames at the device's native
/// rate, so the selection is invisible to the rest of the session.
///
/// # Errors
///
/// Returns error only if both mechanisms fail to initialize.
pub fn open_frame_source(
    active: Arc<AtomicBool>,
    frames: FrameSender,
) -> Result<Box<dyn FrameSource>> {
    match StreamSource::open(Arc::clone(&active), frames.clone()) {
        Ok(source) => {
            tracing::debug!(sample_rate = source.sample_rate(), "capture running (in-callback framing)");
            Ok(Box::new(source))
        }
        Err(stream_err) => {
            tracing::warn!(
                error = %stream_err,
                "stream capture failed to initialize, falling back to polled capture"
            );
            match PolledSource::open(active, frames) {
                Ok(source) => {
                    tracing::debug!(sample_rate = source.sample_rate(), "capture running (polled)");
                    Ok(Box::new(source))
                }
                Err(poll_err) => Err(Error::Capture(format!(
                    "both capture mechanisms failed: {stream_err}; {poll_err}"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(framer: &mut Framer, data: &[f32]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        framer.push(data, |frame| out.push(frame));
        out
    }

    #[test]
    fn test_framer_emits_fixed_blocks() {
        let mut framer = Framer::new(1);
        let input = vec![0.1; FRAME_SIZE * 2];
        let frames = collect_frames(&mut framer, &input);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SIZE));
    }

    #[test]
    fn test_framer_buffers_partial_input() {
        let mut framer = Framer::new(1);
        let input = vec![0.1; FRAME_SIZE - 1];
        let frames = collect_frames(&mut framer, &input);
        assert!(frames.is_empty());

        let frames = collect_frames(&mut framer, &[0.1]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    #[allow(clippy::cast_precision_loss, clippy::float_cmp)]
    fn test_framer_preserves_order_across_calls() {
        let mut framer = Framer::new(1);
        let first: Vec<f32> = (0..FRAME_SIZE).map(|i| i as f32).collect();
        let frames = collect_frames(&mut framer, &first);
        assert_eq!(frames[0][0], 0.0);
        assert_eq!(frames[0][FRAME_SIZE - 1], (FRAME_SIZE - 1) as f32);
    }

    #[test]
    fn test_framer_downmixes_stereo() {
        let mut framer = Framer::new(2);
        let mut interleaved = Vec::with_capacity(FRAME_SIZE * 2);
        for _ in 0..FRAME_SIZE {
            interleaved.push(1.0);
            interleaved.push(0.0);
        }
        let frames = collect_frames(&mut framer, &interleaved);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&s| (s - 0.5).abs() < f32::EPSILON));
    }
}
