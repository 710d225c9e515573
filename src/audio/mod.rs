//! Audio capture, loudness metering, and playback
//!
//! The conversation orchestrator consumes these through the
//! [`CaptureSource`] and [`PlaybackSink`] seams so the pipeline is testable
//! without audio hardware.

mod capture;
mod level;
mod playback;

pub use capture::{CaptureEngine, SAMPLE_RATE, encode_pcm};
pub use level::{AudioLevel, LevelMeter};
pub use playback::{Playback, decode_synthesized};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::Result;

/// Microphone seam consumed by the conversation orchestrator
pub trait CaptureSource: Send {
    /// Acquire the exclusive input stream
    ///
    /// # Errors
    ///
    /// Returns an error when device access is denied or unavailable;
    /// callers must not retry without new user permission.
    fn initialize(&mut self) -> Result<()>;

    /// Begin emitting PCM frames and level measurements; idempotent
    ///
    /// # Errors
    ///
    /// Returns an error when `initialize` has not completed.
    fn start_recording(&mut self) -> Result<()>;

    /// Stop emitting frames and level measurements; idempotent
    fn stop_recording(&mut self);

    /// Set input gain, clamped to [0, 2]
    fn set_gain(&mut self, value: f32);

    /// Take the PCM frame receiver; subsequent calls return `None`
    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Subscribe to loudness measurements
    fn levels(&self) -> broadcast::Receiver<AudioLevel>;

    /// Release the device; idempotent
    fn dispose(&mut self);
}

/// Playback seam consumed by the conversation orchestrator
#[async_trait]
pub trait PlaybackSink: Send {
    /// Decode a synthesized-speech payload and begin playing it
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not decodable audio or the
    /// output device has been released.
    async fn play(&mut self, audio: &[u8]) -> Result<()>;
}
