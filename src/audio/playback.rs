//! Synthesized speech playback
//!
//! Owns the exclusive output device. Payloads are decoded on the caller's
//! thread (WAV or MP3 containers) and handed to a dedicated playback thread
//! that owns the cpal output stream, so playback never blocks the
//! conversation pipeline.

use std::io::Cursor;
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use super::PlaybackSink;
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

enum PlayRequest {
    Samples(Vec<f32>),
    Shutdown,
}

/// Plays decoded audio to the default output device
pub struct Playback {
    requests: std_mpsc::Sender<PlayRequest>,
    handle: Option<JoinHandle<()>>,
}

impl Playback {
    /// Create a playback instance
    ///
    /// # Errors
    ///
    /// Returns an error if no suitable output device can be opened.
    pub fn new() -> Result<Self> {
        let (requests, request_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("babelcall-playback".to_string())
            .spawn(move || playback_thread(&request_rx, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                requests,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("playback thread terminated".to_string())),
        }
    }

    /// Queue raw f32 samples for playback
    ///
    /// # Errors
    ///
    /// Returns an error if the playback thread has stopped.
    pub fn play_samples(&self, samples: Vec<f32>) -> Result<()> {
        self.requests
            .send(PlayRequest::Samples(samples))
            .map_err(|_| Error::Audio("playback thread stopped".to_string()))
    }

    /// Release the output device; safe to call repeatedly
    pub fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(PlayRequest::Shutdown);
            let _ = handle.join();
            tracing::debug!("playback disposed");
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl PlaybackSink for Playback {
    async fn play(&mut self, audio: &[u8]) -> Result<()> {
        let samples = decode_synthesized(audio)?;
        self.play_samples(samples)
    }
}

/// Dedicated thread owning the cpal output stream
fn playback_thread(
    requests: &std_mpsc::Receiver<PlayRequest>,
    ready: &std_mpsc::Sender<Result<()>>,
) {
    let (device, config) = match open_output() {
        Ok(pair) => {
            let _ = ready.send(Ok(()));
            pair
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(request) = requests.recv() {
        match request {
            PlayRequest::Samples(samples) => {
                if let Err(e) = play_blocking(&device, &config, samples) {
                    tracing::error!(error = %e, "playback failed");
                }
            }
            PlayRequest::Shutdown => break,
        }
    }
}

fn open_output() -> Result<(Device, StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok((device, config))
}

/// Play samples to completion on the playback thread
fn play_blocking(device: &Device, config: &StreamConfig, samples: Vec<f32>) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let sample_count = samples.len();
    let channels = config.channels as usize;

    let samples = Arc::new(samples);
    let position = Arc::new(Mutex::new(0_usize));
    let finished = Arc::new(Mutex::new(false));

    let samples_cb = Arc::clone(&samples);
    let position_cb = Arc::clone(&position);
    let finished_cb = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut pos) = position_cb.lock() else {
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < samples_cb.len() {
                        samples_cb[*pos]
                    } else {
                        if let Ok(mut done) = finished_cb.lock() {
                            *done = true;
                        }
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                    if *pos < samples_cb.len() {
                        *pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let timeout = std::time::Duration::from_millis(duration_ms + 500);
    let start = std::time::Instant::now();

    while !finished.lock().map(|done| *done).unwrap_or(true) {
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    // Let the device drain its last buffer
    std::thread::sleep(std::time::Duration::from_millis(100));

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");
    Ok(())
}

/// Decode a synthesized-speech payload into mono f32 samples
///
/// Accepts WAV and MP3 containers, the formats the synthesis backend
/// produces.
///
/// # Errors
///
/// Returns an error when the payload is not decodable audio.
pub fn decode_synthesized(audio: &[u8]) -> Result<Vec<f32>> {
    if audio.starts_with(b"RIFF") {
        decode_wav(audio)
    } else {
        decode_mp3(audio)
    }
}

fn decode_wav(audio: &[u8]) -> Result<Vec<f32>> {
    let reader = hound::WavReader::new(Cursor::new(audio))
        .map_err(|e| Error::Decode(format!("WAV header: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / 32_768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(format!("WAV samples: {e}")))?,
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(format!("WAV samples: {e}")))?,
    };

    Ok(downmix(&samples, spec.channels))
}

fn decode_mp3(audio: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(audio));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32_768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32_768.0;
                        (left + right) / 2.0
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32_768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Decode(format!("MP3: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Decode("no audio frames in payload".to_string()));
    }
    Ok(samples)
}

/// Average interleaved channels down to mono
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let step = channels as usize;
    samples
        .chunks(step)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
