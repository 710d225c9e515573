//! Microphone capture engine
//!
//! Owns the exclusive input stream and produces two independent outputs:
//! little-endian 16-bit PCM frames for transmission, and periodic
//! [`AudioLevel`] measurements for UI feedback. The cpal stream lives on a
//! dedicated thread because streams are not `Send`; recording and gain are
//! toggled through shared state without touching that thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::level::{AudioLevel, LevelMeter};
use super::CaptureSource;
use crate::events::EventBus;
use crate::{Error, Result};

/// Sample rate for speech capture
pub const SAMPLE_RATE: u32 = 16_000;

/// Period of the loudness sampling tick
const LEVEL_TICK: Duration = Duration::from_millis(100);

/// Depth of the PCM frame channel
const FRAME_DEPTH: usize = 32;

/// Level event bus capacity
const LEVEL_CAPACITY: usize = 16;

/// Gain bounds applied by `set_gain`
const GAIN_MIN: f32 = 0.0;
const GAIN_MAX: f32 = 2.0;

/// State shared with the audio callback thread
struct Shared {
    recording: AtomicBool,
    gain_bits: AtomicU32,
    analysis: Mutex<Vec<f32>>,
}

impl Shared {
    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    fn set_gain(&self, value: f32) {
        self.gain_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    fn take_analysis(&self) -> Vec<f32> {
        self.analysis
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

struct Worker {
    shutdown: std_mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

/// Captures audio from the default input device
pub struct CaptureEngine {
    shared: Arc<Shared>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    frames_rx: Option<mpsc::Receiver<Vec<u8>>>,
    levels: EventBus<AudioLevel>,
    worker: Option<Worker>,
    tick: Option<CancellationToken>,
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureEngine {
    /// Create an engine; no device is touched until `initialize`
    #[must_use]
    pub fn new() -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_DEPTH);
        Self {
            shared: Arc::new(Shared {
                recording: AtomicBool::new(false),
                gain_bits: AtomicU32::new(1.0_f32.to_bits()),
                analysis: Mutex::new(Vec::new()),
            }),
            frames_tx,
            frames_rx: Some(frames_rx),
            levels: EventBus::new(LEVEL_CAPACITY),
            worker: None,
            tick: None,
        }
    }

    /// Current gain applied to the signal path
    #[must_use]
    pub fn gain(&self) -> f32 {
        self.shared.gain()
    }

    /// True while frames are being emitted
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Relaxed)
    }

    fn spawn_level_tick(&mut self) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);
        let bus = self.levels.clone();

        tokio::spawn(async move {
            let mut meter = LevelMeter::new();
            let mut ticker = tokio::time::interval(LEVEL_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let samples = shared.take_analysis();
                        bus.emit(meter.tick(&samples));
                    }
                }
            }
        });

        self.tick = Some(token);
    }
}

impl CaptureSource for CaptureEngine {
    /// Acquire the exclusive microphone stream
    ///
    /// Idempotent once acquired. Failure means device access was denied or
    /// no suitable device exists; callers should not retry without new
    /// user permission.
    fn initialize(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let frames = self.frames_tx.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown, shutdown_rx) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("babelcall-capture".to_string())
            .spawn(move || capture_thread(&shared, frames, &ready_tx, &shutdown_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(Worker {
                    shutdown,
                    handle: Some(handle),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::AudioInit("capture thread terminated".to_string())),
        }
    }

    /// Begin emitting frames and level measurements
    ///
    /// No-op while already recording.
    fn start_recording(&mut self) -> Result<()> {
        if self.worker.is_none() {
            return Err(Error::NotInitialized);
        }
        if self.shared.recording.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut buf) = self.shared.analysis.lock() {
            buf.clear();
        }
        self.spawn_level_tick();
        tracing::debug!("recording started");
        Ok(())
    }

    /// Stop emitting frames and halt level sampling
    fn stop_recording(&mut self) {
        if self.shared.recording.swap(false, Ordering::SeqCst) {
            tracing::debug!("recording stopped");
        }
        if let Some(token) = self.tick.take() {
            token.cancel();
        }
    }

    /// Set input gain, clamped to [0, 2]
    ///
    /// Applies to the signal path ahead of analysis and PCM conversion.
    fn set_gain(&mut self, value: f32) {
        self.shared.set_gain(value.clamp(GAIN_MIN, GAIN_MAX));
    }

    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.frames_rx.take()
    }

    fn levels(&self) -> broadcast::Receiver<AudioLevel> {
        self.levels.subscribe()
    }

    /// Release the device stream; safe to call repeatedly
    fn dispose(&mut self) {
        self.stop_recording();
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
            tracing::debug!("capture engine disposed");
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Dedicated thread owning the cpal input stream
fn capture_thread(
    shared: &Arc<Shared>,
    frames: mpsc::Sender<Vec<u8>>,
    ready: &std_mpsc::Sender<Result<()>>,
    shutdown: &std_mpsc::Receiver<()>,
) {
    match build_input_stream(Arc::clone(shared), frames) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            // Hold the stream until shutdown; it is not Send
            let _ = shutdown.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

fn build_input_stream(shared: Arc<Shared>, frames: mpsc::Sender<Vec<u8>>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::AudioInit("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::AudioInit(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::AudioInit("no mono 16 kHz input config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !shared.recording.load(Ordering::Relaxed) {
                    return;
                }
                let gain = shared.gain();
                let mut scaled = Vec::with_capacity(data.len());
                for &sample in data {
                    scaled.push((sample * gain).clamp(-1.0, 1.0));
                }
                if let Ok(mut buf) = shared.analysis.lock() {
                    buf.extend_from_slice(&scaled);
                }
                if frames.try_send(encode_pcm(&scaled)).is_err() {
                    tracing::trace!("pcm frame dropped, channel full");
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::AudioInit(e.to_string()))?;

    stream.play().map_err(|e| Error::AudioInit(e.to_string()))?;
    Ok(stream)
}

/// Convert f32 samples in [-1, 1] to signed 16-bit little-endian PCM
///
/// Out-of-range samples are clamped before conversion, so 1.0 maps to
/// 0x7FFF and -1.0 to 0x8000 without overflow.
#[must_use]
pub fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = f64::from(sample.clamp(-1.0, 1.0));
        #[allow(clippy::cast_possible_truncation)]
        let value = (clamped * 32_768.0).clamp(-32_768.0, 32_767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
