//! Microphone loudness metering
//!
//! One [`LevelMeter`] tick consumes the samples captured since the previous
//! tick and produces an [`AudioLevel`]: the instantaneous RMS loudness, a
//! smoothed trailing average, and a clip flag. Metering is decoupled from
//! frame transmission so UI feedback keeps working whether or not frames
//! are being sent anywhere.

/// Near-saturation threshold, as a fraction of full scale
const CLIP_THRESHOLD: f32 = 0.95;

/// Analysis bins the tick buffer is partitioned into
const ANALYSIS_BINS: usize = 32;

/// Bins above the threshold required before the tick counts as clipping
const CLIP_BIN_LIMIT: usize = 5;

/// Per-tick decay of the smoothed level
const SLOW_DECAY: f32 = 0.95;

/// One tick's loudness measurement
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioLevel {
    /// RMS loudness of this tick, in [0, 1]
    pub instant: f32,
    /// Exponentially smoothed trailing average
    pub slow: f32,
    /// More than a fixed number of analysis bins peaked near full scale
    pub clip: bool,
}

/// Stateful loudness meter
#[derive(Debug, Default)]
pub struct LevelMeter {
    slow: f32,
}

impl LevelMeter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one tick's samples and produce the level for that tick
    pub fn tick(&mut self, samples: &[f32]) -> AudioLevel {
        let instant = rms(samples).clamp(0.0, 1.0);
        self.slow = SLOW_DECAY * self.slow + (1.0 - SLOW_DECAY) * instant;
        AudioLevel {
            instant,
            slow: self.slow,
            clip: clipped_bins(samples) > CLIP_BIN_LIMIT,
        }
    }

    /// Forget the smoothed history
    pub fn reset(&mut self) {
        self.slow = 0.0;
    }
}

/// RMS energy of a sample buffer
#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Count analysis bins whose peak reaches the clip threshold
fn clipped_bins(samples: &[f32]) -> usize {
    if samples.is_empty() {
        return 0;
    }
    let bin_len = samples.len().div_ceil(ANALYSIS_BINS);
    samples
        .chunks(bin_len)
        .filter(|bin| bin.iter().any(|s| s.abs() >= CLIP_THRESHOLD))
        .count()
}
