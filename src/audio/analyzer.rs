//! Output spectrum accessor
//!
//! Read-only frequency data over the most recent playback window. This is
//! the interface boundary for the frequency-bar visualizer; rendering
//! itself lives in the presentation layer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Analysis window size in samples
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins exposed by [`SpectrumAnalyzer::frequency_data`]
pub const FREQUENCY_BINS: usize = FFT_SIZE / 2;

/// Floor of the byte magnitude scale, in decibels relative to full scale
const MIN_DECIBELS: f32 = -100.0;

/// Ceiling of the byte magnitude scale, in decibels relative to full scale
const MAX_DECIBELS: f32 = -30.0;

/// Rolling spectrum over the most recent output samples
///
/// Cloning shares the underlying window; the mixer feeds samples in and the
/// presentation layer reads magnitudes out.
#[derive(Debug, Clone, Default)]
pub struct SpectrumAnalyzer {
    window: Arc<Mutex<VecDeque<f32>>>,
}

impl SpectrumAnalyzer {
    /// Create an analyzer with an empty window
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(FFT_SIZE))),
        }
    }

    /// Feed mono output samples, keeping the most recent [`FFT_SIZE`]
    pub fn push_samples(&self, samples: &[f32]) {
        if let Ok(mut window) = self.window.lock() {
            for &sample in samples {
                if window.len() == FFT_SIZE {
                    window.pop_front();
                }
                window.push_back(sample);
            }
        }
    }

    /// Feed interleaved output samples, taking the first channel of each frame
    pub fn push_interleaved(&self, data: &[f32], channels: usize) {
        if channels <= 1 {
            self.push_samples(data);
            return;
        }
        if let Ok(mut window) = self.window.lock() {
            for frame in data.chunks(channels) {
                if window.len() == FFT_SIZE {
                    window.pop_front();
                }
                window.push_back(frame[0]);
            }
        }
    }

    /// Byte magnitudes for [`FREQUENCY_BINS`] bins over the latest window
    ///
    /// Values are scaled 0..=255 between [`MIN_DECIBELS`] and
    /// [`MAX_DECIBELS`], so silence reads as all zeros.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn frequency_data(&self) -> Vec<u8> {
        let window: Vec<f32> = match self.window.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => return vec![0; FREQUENCY_BINS],
        };
        if window.is_empty() {
            return vec![0; FREQUENCY_BINS];
        }

        let n = window.len();
        let denom = (n.max(2) - 1) as f32;
        let windowed: Vec<f32> = window
            .iter()
            .enumerate()
            .map(|(i, &sample)| {
                let hann = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / denom).cos();
                sample * hann
            })
            .collect();

        (0..FREQUENCY_BINS)
            .map(|bin| {
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                for (i, &sample) in windowed.iter().enumerate() {
                    let phase =
                        -2.0 * std::f32::consts::PI * bin as f32 * i as f32 / FFT_SIZE as f32;
                    re += sample * phase.cos();
                    im += sample * phase.sin();
                }
                let magnitude = re.hypot(im) * 2.0 / FFT_SIZE as f32;
                let db = 20.0 * magnitude.max(1e-10).log10();
                let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
                (scaled.clamp(0.0, 1.0) * 255.0) as u8
            })
            .collect()
    }

    /// Clear the window
    pub fn reset(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.clear();
        }
    }
}
