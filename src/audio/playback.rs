//! Playback scheduling and output mixing
//!
//! Maintains gapless sequential playback of server audio despite network
//! jitter. Decoded buffers are scheduled at exact positions on the output
//! device's own clock; the mixer renders them sample-accurately and removes
//! each item when its last sample has played.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::analyzer::SpectrumAnalyzer;
use crate::audio::pcm::AudioBuffer;
use crate::{Error, Result};

/// Sample rate of the output device (matches server synthesis)
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// A monotonically advancing point on the playback timeline, in seconds
pub trait PlaybackClock: Send + Sync {
    /// Current position of the output clock
    fn now(&self) -> f64;
}

/// Clock advanced by samples the output stream has actually written
///
/// Scheduling against frames really delivered to the device (rather than
/// wall time) keeps start positions sample-accurate under jitter.
#[derive(Debug)]
pub struct SampleClock {
    frames: AtomicU64,
    sample_rate: u32,
}

impl SampleClock {
    /// Create a clock at position zero
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate,
        }
    }

    /// Absolute frame position
    fn position(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Advance by frames written to the device
    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

impl PlaybackClock for SampleClock {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.position() as f64 / f64::from(self.sample_rate)
    }
}

/// Manually advanced clock for driving the scheduler without audio hardware
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Create a clock at position zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            micros: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `seconds`
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn advance(&self, seconds: f64) {
        self.micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::AcqRel);
    }
}

impl PlaybackClock for ManualClock {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.micros.load(Ordering::Acquire) as f64 / 1_000_000.0
    }
}

/// A decoded buffer scheduled at an exact start time
#[derive(Debug)]
pub struct ScheduledItem {
    start: f64,
    buffer: AudioBuffer,
    rendered: usize,
}

impl ScheduledItem {
    /// Scheduled start position on the playback clock, in seconds
    #[must_use]
    pub const fn start_time(&self) -> f64 {
        self.start
    }

    /// Mix the overlap of this item with the block starting at
    /// `block_start` (absolute frame position) into `out`
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn mix_into(&mut self, out: &mut [f32], channels: usize, block_start: u64, sample_rate: u32) {
        let start_sample = (self.start * f64::from(sample_rate)).round() as i64;
        let len = self.buffer.samples.len();
        let block_start = i64::try_from(block_start).unwrap_or(i64::MAX);

        // The whole item lies in the past (clock moved beyond its end
        // before it was ever rendered): mark it consumed.
        if block_start >= start_sample + i64::try_from(len).unwrap_or(i64::MAX) {
            self.rendered = len;
            return;
        }

        let frames = out.len() / channels;
        for i in 0..frames {
            let index = block_start + i64::try_from(i).unwrap_or(i64::MAX) - start_sample;
            if index < 0 {
                continue;
            }
            let index = index as usize;
            let Some(&sample) = self.buffer.samples.get(index) else {
                break;
            };
            for out_sample in &mut out[i * channels..(i + 1) * channels] {
                *out_sample += sample;
            }
            self.rendered = self.rendered.max(index + 1);
        }
    }

    /// True once the last sample has been consumed
    fn finished(&self) -> bool {
        self.rendered >= self.buffer.samples.len()
    }
}

/// The in-flight item set, shared between the scheduler and the mixer
pub type InflightSet = Arc<Mutex<Vec<ScheduledItem>>>;

/// Create an empty in-flight set
#[must_use]
pub fn new_inflight_set() -> InflightSet {
    Arc::new(Mutex::new(Vec::new()))
}

/// Schedules decoded buffers for gapless, strictly ordered playback
///
/// Only the scheduler mutates `next_start_time` and adds to the in-flight
/// set; the mixer removes items as they complete. Both operations run on a
/// single logical timeline (the session loop and interruption handler), so
/// no two components race on the clock.
pub struct PlaybackScheduler {
    clock: Arc<dyn PlaybackClock>,
    inflight: InflightSet,
    next_start_time: f64,
}

impl PlaybackScheduler {
    /// Create a scheduler with its own in-flight set
    #[must_use]
    pub fn new(clock: Arc<dyn PlaybackClock>) -> Self {
        Self::with_items(clock, new_inflight_set())
    }

    /// Create a scheduler over an existing in-flight set (shared with an
    /// output mixer)
    #[must_use]
    pub fn with_items(clock: Arc<dyn PlaybackClock>, inflight: InflightSet) -> Self {
        Self {
            clock,
            inflight,
            next_start_time: 0.0,
        }
    }

    /// Schedule a decoded buffer and return its start time
    ///
    /// Never schedules in the past, and never leaves a gap between
    /// consecutive items that arrive on time. A late item starts at the
    /// current clock position instead, which is an audible gap but not an
    /// error.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> f64 {
        self.next_start_time = self.next_start_time.max(self.clock.now());
        let start = self.next_start_time;
        self.next_start_time += buffer.duration();

        if let Ok(mut items) = self.inflight.lock() {
            items.push(ScheduledItem {
                start,
                buffer,
                rendered: 0,
            });
        }
        tracing::trace!(start, next = self.next_start_time, "scheduled playback item");
        start
    }

    /// Server barge-in: stop every in-flight item and restart the timeline
    ///
    /// The next arriving chunk starts immediately.
    pub fn interrupt(&mut self) {
        let stopped = self.drain();
        self.next_start_time = 0.0;
        tracing::debug!(stopped, "playback interrupted");
    }

    /// Teardown: stop all in-flight items without resetting the timeline
    pub fn clear(&mut self) {
        let stopped = self.drain();
        if stopped > 0 {
            tracing::debug!(stopped, "in-flight playback stopped");
        }
    }

    fn drain(&mut self) -> usize {
        self.inflight.lock().map_or(0, |mut items| {
            let stopped = items.len();
            items.clear();
            stopped
        })
    }

    /// Number of items currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map_or(0, |items| items.len())
    }

    /// Next gapless start position on the playback clock, in seconds
    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// The shared in-flight set (handed to the output mixer)
    #[must_use]
    pub fn items(&self) -> InflightSet {
        Arc::clone(&self.inflight)
    }
}

/// Output device running the mixer on its own thread
///
/// The mixer renders scheduled items sample-accurately, advances the
/// [`SampleClock`], and feeds post-mix samples to the spectrum analyzer.
pub struct AudioOutput {
    clock: Arc<SampleClock>,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioOutput {
    /// Open the default output device and start the mixer
    ///
    /// # Errors
    ///
    /// Returns error if no output device or suitable configuration exists,
    /// or the stream fails to start.
    pub fn open(inflight: InflightSet, analyzer: SpectrumAnalyzer) -> Result<Self> {
        let clock = Arc::new(SampleClock::new(OUTPUT_SAMPLE_RATE));
        let mixer_clock = Arc::clone(&clock);

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let stream = match build_mixer_stream(&inflight, &mixer_clock, &analyzer) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Hold the stream alive until stop is requested.
            let _ = stop_rx.recv();
            drop(stream);
        });

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("output thread exited before reporting".to_string()))??;

        Ok(Self {
            clock,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// The device clock items are scheduled against
    #[must_use]
    pub fn clock(&self) -> Arc<SampleClock> {
        Arc::clone(&self.clock)
    }

    /// Stop the mixer and release the device (idempotent)
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!("output stopped");
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find an output configuration at the synthesis rate, mono preferred
fn open_output_device() -> Result<(cpal::Device, cpal::StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: stereo, same samples written to both channels
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported
        .with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = OUTPUT_SAMPLE_RATE,
        channels = config.channels,
        "output device opened"
    );

    Ok((device, config))
}

fn build_mixer_stream(
    inflight: &InflightSet,
    clock: &Arc<SampleClock>,
    analyzer: &SpectrumAnalyzer,
) -> Result<cpal::Stream> {
    let (device, config) = open_output_device()?;
    let channels = config.channels as usize;
    let inflight = Arc::clone(inflight);
    let clock = Arc::clone(clock);
    let analyzer = analyzer.clone();

    let stream = device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                out.fill(0.0);
                let block_start = clock.position();
                if let Ok(mut items) = inflight.lock() {
                    for item in items.iter_mut() {
                        item.mix_into(out, channels, block_start, OUTPUT_SAMPLE_RATE);
                    }
                    items.retain(|item| !item.finished());
                }
                analyzer.push_interleaved(out, channels);
                clock.advance((out.len() / channels) as u64);
            },
            |err| {
                tracing::error!(error = %err, "output stream error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_second_buffer() -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.25; 12_000],
            sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }

    #[test]
    fn test_back_to_back_chunks_are_gapless() {
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(clock);

        let first = scheduler.schedule(half_second_buffer());
        let second = scheduler.schedule(half_second_buffer());

        assert!((first - 0.0).abs() < f64::EPSILON);
        assert!((second - 0.5).abs() < f64::EPSILON);
        assert!((scheduler.next_start_time() - 1.0).abs() < f64::EPSILON);
        assert_eq!(scheduler.in_flight(), 2);
    }

    #[test]
    fn test_late_chunk_starts_now_not_in_the_past() {
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(clock.clone());

        scheduler.schedule(half_second_buffer());
        // The first item finished long ago; the next chunk is late.
        clock.advance(2.0);
        let start = scheduler.schedule(half_second_buffer());

        assert!((start - 2.0).abs() < f64::EPSILON);
        assert!((scheduler.next_start_time() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_interrupt_empties_set_and_resets_clock_origin() {
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(clock);

        for _ in 0..3 {
            scheduler.schedule(half_second_buffer());
        }
        assert_eq!(scheduler.in_flight(), 3);

        scheduler.interrupt();
        assert_eq!(scheduler.in_flight(), 0);
        assert!((scheduler.next_start_time() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_interrupt_with_nothing_in_flight() {
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(clock);
        scheduler.interrupt();
        assert_eq!(scheduler.in_flight(), 0);
        assert!((scheduler.next_start_time() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clear_keeps_timeline() {
        let clock = Arc::new(ManualClock::new());
        let mut scheduler = PlaybackScheduler::new(clock);
        scheduler.schedule(half_second_buffer());
        scheduler.clear();
        assert_eq!(scheduler.in_flight(), 0);
        assert!((scheduler.next_start_time() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_mixer_renders_scheduled_samples() {
        let inflight = new_inflight_set();
        let clock = Arc::new(SampleClock::new(OUTPUT_SAMPLE_RATE));
        let mut scheduler =
            PlaybackScheduler::with_items(clock.clone(), Arc::clone(&inflight));

        scheduler.schedule(AudioBuffer {
            samples: vec![0.5; 64],
            sample_rate: OUTPUT_SAMPLE_RATE,
        });

        let mut out = vec![0.0f32; 128];
        if let Ok(mut items) = inflight.lock() {
            for item in items.iter_mut() {
                item.mix_into(&mut out, 1, clock.position(), OUTPUT_SAMPLE_RATE);
            }
            items.retain(|item| !item.finished());
        }
        clock.advance(128);

        assert!(out[..64].iter().all(|&s| (s - 0.5).abs() < f32::EPSILON));
        assert!(out[64..].iter().all(|&s| s == 0.0));
        assert_eq!(inflight.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_mixer_respects_future_start_times() {
        let inflight = new_inflight_set();
        let clock = Arc::new(SampleClock::new(OUTPUT_SAMPLE_RATE));
        let mut scheduler =
            PlaybackScheduler::with_items(clock.clone(), Arc::clone(&inflight));

        // First item occupies [0, 64); second starts at sample 64.
        scheduler.schedule(AudioBuffer {
            samples: vec![0.5; 64],
            sample_rate: OUTPUT_SAMPLE_RATE,
        });
        scheduler.schedule(AudioBuffer {
            samples: vec![0.25; 64],
            sample_rate: OUTPUT_SAMPLE_RATE,
        });

        let mut out = vec![0.0f32; 128];
        if let Ok(mut items) = inflight.lock() {
            for item in items.iter_mut() {
                item.mix_into(&mut out, 1, 0, OUTPUT_SAMPLE_RATE);
            }
        }

        assert!((out[0] - 0.5).abs() < f32::EPSILON);
        assert!((out[63] - 0.5).abs() < f32::EPSILON);
        assert!((out[64] - 0.25).abs() < f32::EPSILON);
        assert!((out[127] - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_stale_item_is_marked_finished() {
        let inflight = new_inflight_set();
        let clock = Arc::new(SampleClock::new(OUTPUT_SAMPLE_RATE));
        let mut scheduler =
            PlaybackScheduler::with_items(clock.clone(), Arc::clone(&inflight));

        scheduler.schedule(AudioBuffer {
            samples: vec![0.5; 64],
            sample_rate: OUTPUT_SAMPLE_RATE,
        });

        // The clock has moved far beyond the item before it ever rendered.
        let mut out = vec![0.0f32; 32];
        if let Ok(mut items) = inflight.lock() {
            for item in items.iter_mut() {
                item.mix_into(&mut out, 1, 1_000_000, OUTPUT_SAMPLE_RATE);
            }
            items.retain(|item| !item.finished());
        }

        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(inflight.lock().unwrap().len(), 0);
    }
}
