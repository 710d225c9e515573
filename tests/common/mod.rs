//! Shared test doubles for the conversation pipeline
//!
//! The transport is exercised through an in-memory connector and the
//! orchestrator through scripted capture/playback seams, so no test needs
//! audio hardware or a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use babelcall::{
    AudioLevel, CaptureSource, Connection, Connector, Error, LinkStatus, PlaybackSink, Result,
    RetryPolicy, TransportConfig, WireFrame,
};

/// Far end of one accepted connection
pub struct Peer {
    /// Frames the client wrote to the socket
    pub sent: mpsc::Receiver<WireFrame>,
    /// Push frames toward the client; dropping this closes the connection
    pub push: mpsc::Sender<WireFrame>,
}

impl Peer {
    /// Next frame the client sent, within a deadline
    pub async fn next_sent(&mut self) -> WireFrame {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
    }

    /// Drain whatever the client has sent so far
    pub fn drain_sent(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Push a structured text frame toward the client
    pub async fn push_text(&self, text: &str) {
        self.push
            .send(WireFrame::Text(text.to_string()))
            .await
            .expect("peer closed");
    }

    /// Push a binary frame toward the client
    pub async fn push_binary(&self, bytes: Vec<u8>) {
        self.push
            .send(WireFrame::Binary(bytes))
            .await
            .expect("peer closed");
    }
}

/// Connector producing in-memory connections according to a dial plan
pub struct FakeConnector {
    plan: Mutex<VecDeque<bool>>,
    peers: mpsc::UnboundedSender<Peer>,
    dials: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeConnector {
    /// Returns the connector and the stream of accepted peers
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(VecDeque::new()),
            peers,
            dials: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        (connector, accepted)
    }

    /// Queue dial outcomes; unplanned dials are accepted
    pub fn plan(&self, outcomes: &[bool]) {
        self.plan.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn dialed_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let accepted = self.plan.lock().unwrap().pop_front().unwrap_or(true);
        if !accepted {
            return Err(Error::Transport("dial refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.peers.send(Peer {
            sent: out_rx,
            push: in_tx,
        });
        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Wait for one accepted peer
pub async fn accept_peer(accepted: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Transport configuration with test-friendly timings
pub fn test_transport_config() -> TransportConfig {
    TransportConfig {
        endpoint: url::Url::parse("ws://test.invalid/ws").unwrap(),
        retry: RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            multiplier: 1.5,
            max_delay: Duration::from_millis(50),
        },
        drain_gap: Duration::from_millis(1),
        keepalive: Duration::from_secs(60),
    }
}

/// Observable side of a [`FakeCapture`]
pub struct CaptureProbe {
    pub initialized: Arc<AtomicBool>,
    pub recording: Arc<AtomicBool>,
    pub disposed: Arc<AtomicBool>,
    pub gain: Arc<Mutex<f32>>,
    /// Feed PCM frames as if the microphone produced them
    pub frames: mpsc::Sender<Vec<u8>>,
    /// Feed loudness measurements
    pub levels: broadcast::Sender<AudioLevel>,
}

/// Scripted capture source
pub struct FakeCapture {
    fail_init: bool,
    fail_start: bool,
    initialized: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    disposed: Arc<AtomicBool>,
    gain: Arc<Mutex<f32>>,
    frames_rx: Option<mpsc::Receiver<Vec<u8>>>,
    levels: broadcast::Sender<AudioLevel>,
}

impl FakeCapture {
    pub fn new() -> (Self, CaptureProbe) {
        Self::build(false, false)
    }

    /// A capture source whose stream fails to start
    pub fn failing_start() -> (Self, CaptureProbe) {
        Self::build(false, true)
    }

    /// A capture source whose device acquisition fails
    pub fn failing_init() -> (Self, CaptureProbe) {
        Self::build(true, false)
    }

    fn build(fail_init: bool, fail_start: bool) -> (Self, CaptureProbe) {
        let (frames_tx, frames_rx) = mpsc::channel(32);
        let (levels_tx, _) = broadcast::channel(16);
        let initialized = Arc::new(AtomicBool::new(false));
        let recording = Arc::new(AtomicBool::new(false));
        let disposed = Arc::new(AtomicBool::new(false));
        let gain = Arc::new(Mutex::new(1.0_f32));

        let probe = CaptureProbe {
            initialized: Arc::clone(&initialized),
            recording: Arc::clone(&recording),
            disposed: Arc::clone(&disposed),
            gain: Arc::clone(&gain),
            frames: frames_tx,
            levels: levels_tx.clone(),
        };
        let capture = Self {
            fail_init,
            fail_start,
            initialized,
            recording,
            disposed,
            gain,
            frames_rx: Some(frames_rx),
            levels: levels_tx,
        };
        (capture, probe)
    }
}

impl CaptureSource for FakeCapture {
    fn initialize(&mut self) -> Result<()> {
        if self.fail_init {
            return Err(Error::AudioInit("device access denied".to_string()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        if self.fail_start {
            return Err(Error::Audio("stream failed to start".to_string()));
        }
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_recording(&mut self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    fn set_gain(&mut self, value: f32) {
        *self.gain.lock().unwrap() = value;
    }

    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.frames_rx.take()
    }

    fn levels(&self) -> broadcast::Receiver<AudioLevel> {
        self.levels.subscribe()
    }

    fn dispose(&mut self) {
        self.recording.store(false, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Playback sink that records payloads instead of playing them
pub struct RecordingPlayback {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingPlayback {
    pub fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                played: Arc::clone(&played),
            },
            played,
        )
    }
}

#[async_trait]
impl PlaybackSink for RecordingPlayback {
    async fn play(&mut self, audio: &[u8]) -> Result<()> {
        self.played.lock().unwrap().push(audio.to_vec());
        Ok(())
    }
}

/// Poll until `check` passes or the deadline expires
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting until {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await a specific link status
pub async fn wait_status(watch: &mut tokio::sync::watch::Receiver<LinkStatus>, want: LinkStatus) {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            if *watch.borrow_and_update() == want {
                return;
            }
            watch.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {want:?}"));
}
