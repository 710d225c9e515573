//! Reconnecting full-duplex channel to the backend
//!
//! Carries binary PCM audio frames and `{type, data}` structured messages
//! over one WebSocket scoped to a session. The channel is an actor: a
//! [`TransportChannel`] handle sends commands to a task that owns the
//! socket, the outbound audio queue, and the reconnect state machine.
//!
//! Outbound audio is drained in strict FIFO order with a minimum inter-send
//! gap so a burst of captured frames cannot saturate the socket. Send
//! failures surface as typed error events and never tear the channel down;
//! only the platform-level close drives the reconnect path.

pub mod messages;
pub mod socket;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use url::Url;

use crate::events::EventBus;
use crate::{Error, Result};
use messages::{
    ClientMessage, ServerMessage, SessionConfig, SessionUpdatePayload, TranscriptPayload,
    TranslationPayload, TtsRequest,
};
use socket::{Connection, Connector, WireFrame};

/// Command queue depth between handles and the actor
const COMMAND_DEPTH: usize = 64;

/// Event bus capacity per subscriber
const EVENT_CAPACITY: usize = 256;

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No connection and none wanted
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Connected; traffic flows
    Open,
    /// Unexpectedly closed, reconnect scheduled
    ClosedRetrying,
    /// Retry budget spent; an explicit `connect` is required
    ClosedExhausted,
}

/// Exponential backoff policy for reconnect attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before the channel gives up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(2000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let millis = (self.initial_delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Transport channel configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket base address; the session id is appended as a path segment
    pub endpoint: Url,
    /// Reconnect behavior on unexpected close
    pub retry: RetryPolicy,
    /// Minimum gap between consecutive audio frame sends
    pub drain_gap: Duration,
    /// Keepalive ping period while open
    pub keepalive: Duration,
}

impl TransportConfig {
    /// Connection target for a session
    ///
    /// # Errors
    ///
    /// Returns an error when the session id does not form a valid URL.
    pub fn endpoint_for(&self, session_id: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{session_id}"))
            .map_err(|e| Error::Transport(format!("bad endpoint for session {session_id}: {e}")))
    }
}

/// Soft failure reported as an event rather than a fault
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: String,
    pub message: String,
}

/// Events published by the transport channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection state changed
    Status(LinkStatus),
    /// Recognized utterance arrived
    Transcript(TranscriptPayload),
    /// Translation for a previously delivered transcript arrived
    Translation(TranslationPayload),
    /// Backend-pushed session metadata
    SessionUpdate(SessionUpdatePayload),
    /// Synthesized speech audio (opaque container bytes)
    SynthesizedAudio(Vec<u8>),
    /// Soft failure (send error, decode error, backend-reported error)
    Error(TransportError),
}

enum Command {
    Connect {
        session_id: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    SendAudio(Vec<u8>),
    SendConfig(SessionConfig),
    RequestTts(TtsRequest),
}

/// Handle to the transport actor
///
/// Clones share one channel. Dropping every handle stops the actor and
/// closes the socket.
#[derive(Clone)]
pub struct TransportChannel {
    commands: mpsc::Sender<Command>,
    events: EventBus<TransportEvent>,
    status: watch::Receiver<LinkStatus>,
}

impl TransportChannel {
    /// Spawn the channel actor
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let events = EventBus::new(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(LinkStatus::Disconnected);

        let actor = Actor {
            config,
            connector,
            events: events.clone(),
            status: status_tx,
            session_config: SessionConfig::default(),
            session_id: None,
            queue: VecDeque::new(),
            outgoing: None,
            attempts: 0,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            events,
            status,
        }
    }

    /// Connect to the backend, scoped to `session_id`
    ///
    /// Resolves once the socket reports open; the current session
    /// configuration is pushed before any other traffic. A failed dial
    /// enters the reconnect path on its own.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial dial fails.
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                session_id: session_id.to_string(),
                ack,
            })
            .await
            .map_err(|_| Error::Transport("channel actor stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Transport("channel actor stopped".to_string()))?
    }

    /// Close deliberately and clear the session binding
    ///
    /// Does not enter the reconnect path.
    pub async fn disconnect(&self) {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { ack })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Enqueue one PCM audio frame
    ///
    /// Fire-and-forget: frames are drained FIFO while the channel is open
    /// and dropped when it closes first. No backpressure is reported.
    pub async fn send_audio(&self, frame: Vec<u8>) {
        let _ = self.commands.send(Command::SendAudio(frame)).await;
    }

    /// Merge `partial` into the session configuration and push it
    ///
    /// The merge always happens locally; the merged configuration is
    /// transmitted while open and re-sent automatically when the channel
    /// reopens.
    pub async fn send_config(&self, partial: SessionConfig) {
        let _ = self.commands.send(Command::SendConfig(partial)).await;
    }

    /// Request speech synthesis
    ///
    /// The result arrives asynchronously as a [`TransportEvent::SynthesizedAudio`]
    /// event; responses carry no correlation id.
    pub async fn request_tts(&self, text: &str, language: &str) {
        let _ = self
            .commands
            .send(Command::RequestTts(TtsRequest {
                text: text.to_string(),
                language: language.to_string(),
            }))
            .await;
    }

    /// Subscribe to transport events
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }
}

struct Actor {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    events: EventBus<TransportEvent>,
    status: watch::Sender<LinkStatus>,
    session_config: SessionConfig,
    session_id: Option<String>,
    queue: VecDeque<Vec<u8>>,
    outgoing: Option<mpsc::Sender<WireFrame>>,
    attempts: u32,
}

impl Actor {
    #[allow(clippy::too_many_lines)]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut incoming: Option<mpsc::Receiver<WireFrame>> = None;
        let mut reconnect: Option<Pin<Box<Sleep>>> = None;

        let mut drain = tokio::time::interval(self.config.drain_gap);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = incoming.is_some();
            let drain_ready = connected && !self.queue.is_empty();
            let retry_pending = reconnect.is_some();

            tokio::select! {
                maybe_command = commands.recv() => {
                    let Some(command) = maybe_command else { break };
                    match command {
                        Command::Connect { session_id, ack } => {
                            reconnect = None;
                            incoming = None;
                            // Drop any live socket; the queue survives an
                            // explicit connect (it is cleared on close only)
                            self.outgoing = None;
                            self.attempts = 0;
                            self.session_id = Some(session_id);
                            match self.open().await {
                                Ok(rx) => {
                                    incoming = Some(rx);
                                    keepalive.reset();
                                    let _ = ack.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = ack.send(Err(e));
                                    reconnect = self.on_connection_closed().map(retry_timer);
                                }
                            }
                        }
                        Command::Disconnect { ack } => {
                            reconnect = None;
                            incoming = None;
                            self.session_id = None;
                            self.drop_connection();
                            self.attempts = 0;
                            self.set_status(LinkStatus::Disconnected);
                            tracing::info!("transport disconnected");
                            let _ = ack.send(());
                        }
                        Command::SendAudio(frame) => self.queue.push_back(frame),
                        Command::SendConfig(partial) => self.apply_config(partial),
                        Command::RequestTts(request) => self.request_tts(&request),
                    }
                }
                frame = async { incoming.as_mut().expect("guarded by connected").recv().await },
                    if connected =>
                {
                    match frame {
                        Some(frame) => self.handle_frame(frame),
                        None => {
                            incoming = None;
                            tracing::warn!("connection closed unexpectedly");
                            reconnect = self.on_connection_closed().map(retry_timer);
                        }
                    }
                }
                _ = drain.tick(), if drain_ready => self.drain_one(),
                _ = keepalive.tick(), if connected => self.send_ping(),
                () = async { reconnect.as_mut().expect("guarded by retry_pending").as_mut().await },
                    if retry_pending =>
                {
                    reconnect = None;
                    match self.open().await {
                        Ok(rx) => {
                            incoming = Some(rx);
                            keepalive.reset();
                        }
                        Err(_) => reconnect = self.on_connection_closed().map(retry_timer),
                    }
                }
            }
        }
    }

    /// Dial the backend for the bound session
    ///
    /// On success the merged session configuration is pushed before any
    /// other traffic so the backend always holds a configuration when
    /// audio arrives.
    async fn open(&mut self) -> Result<mpsc::Receiver<WireFrame>> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| Error::Transport("no session bound".to_string()))?;
        let url = self.config.endpoint_for(&session_id)?;

        self.set_status(LinkStatus::Connecting);
        tracing::debug!(url = %url, "dialing backend");

        match self.connector.connect(url.as_str()).await {
            Ok(Connection { outgoing, incoming }) => {
                self.outgoing = Some(outgoing);
                self.attempts = 0;
                self.set_status(LinkStatus::Open);
                tracing::info!(session_id = %session_id, "transport open");
                self.push_config();
                Ok(incoming)
            }
            Err(e) => {
                self.emit_error("connection_failed", &e.to_string());
                Err(e)
            }
        }
    }

    /// Handle a lost connection; returns the delay before the next attempt
    ///
    /// The outbound queue is cleared: frames enqueued before the close are
    /// never replayed across a reconnect.
    fn on_connection_closed(&mut self) -> Option<Duration> {
        self.drop_connection();

        if self.session_id.is_none() {
            self.set_status(LinkStatus::Disconnected);
            return None;
        }
        if self.attempts >= self.config.retry.max_attempts {
            self.set_status(LinkStatus::ClosedExhausted);
            tracing::warn!(
                attempts = self.attempts,
                "reconnect budget exhausted, giving up"
            );
            return None;
        }

        let delay = self.config.retry.delay_for(self.attempts);
        self.attempts += 1;
        self.set_status(LinkStatus::ClosedRetrying);
        tracing::info!(
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        Some(delay)
    }

    fn drop_connection(&mut self) {
        self.outgoing = None;
        self.queue.clear();
    }

    /// Send the frame at the head of the queue, preserving FIFO order
    fn drain_one(&mut self) {
        let Some(frame) = self.queue.pop_front() else {
            return;
        };
        let Some(outgoing) = self.outgoing.as_ref() else {
            return;
        };
        match outgoing.try_send(WireFrame::Binary(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Writer saturated: put the frame back and retry next tick
                if let WireFrame::Binary(bytes) = frame {
                    self.queue.push_front(bytes);
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.emit_error("audio_send_error", "socket writer closed");
            }
        }
    }

    fn apply_config(&mut self, partial: SessionConfig) {
        self.session_config.merge(partial);
        if self.outgoing.is_some() {
            self.push_config();
        }
    }

    fn push_config(&self) {
        if self.session_config.is_empty() {
            return;
        }
        self.send_structured(
            &ClientMessage::Config(self.session_config.clone()),
            "config_send_error",
        );
    }

    fn request_tts(&self, request: &TtsRequest) {
        if self.outgoing.is_none() {
            self.emit_error("tts_request_error", "channel not open");
            return;
        }
        self.send_structured(&ClientMessage::Tts(request.clone()), "tts_request_error");
    }

    fn send_ping(&self) {
        let Some(outgoing) = self.outgoing.as_ref() else {
            return;
        };
        if let Ok(text) = serde_json::to_string(&ClientMessage::Ping) {
            if outgoing.try_send(WireFrame::Text(text)).is_err() {
                tracing::debug!("keepalive ping not sent");
            }
        }
    }

    fn send_structured(&self, message: &ClientMessage, error_code: &str) {
        let Some(outgoing) = self.outgoing.as_ref() else {
            self.emit_error(error_code, "channel not open");
            return;
        };
        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = outgoing.try_send(WireFrame::Text(text)) {
                    self.emit_error(error_code, &e.to_string());
                }
            }
            Err(e) => self.emit_error(error_code, &e.to_string()),
        }
    }

    fn handle_frame(&self, frame: WireFrame) {
        match frame {
            // Binary traffic from the backend is always synthesized speech
            WireFrame::Binary(audio) => {
                tracing::trace!(bytes = audio.len(), "synthesized audio received");
                self.events.emit(TransportEvent::SynthesizedAudio(audio));
            }
            WireFrame::Text(text) => match ServerMessage::parse(&text) {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "malformed message dropped");
                    self.emit_error("decode_error", &e.to_string());
                }
            },
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Transcript(payload) => {
                self.events.emit(TransportEvent::Transcript(payload));
            }
            ServerMessage::Translation(payload) => {
                self.events.emit(TransportEvent::Translation(payload));
            }
            ServerMessage::SessionUpdate(payload) => {
                self.events.emit(TransportEvent::SessionUpdate(payload));
            }
            ServerMessage::Error(payload) => {
                tracing::warn!(code = %payload.code, message = %payload.message, "backend error");
                self.events.emit(TransportEvent::Error(TransportError {
                    code: payload.code,
                    message: payload.message,
                }));
            }
            ServerMessage::Pong => tracing::trace!("pong"),
        }
    }

    fn set_status(&mut self, status: LinkStatus) {
        if *self.status.borrow() == status {
            return;
        }
        let _ = self.status.send(status);
        self.events.emit(TransportEvent::Status(status));
    }

    fn emit_error(&self, code: &str, message: &str) {
        tracing::warn!(code, message, "transport error");
        self.events.emit(TransportEvent::Error(TransportError {
            code: code.to_string(),
            message: message.to_string(),
        }));
    }
}

fn retry_timer(delay: Duration) -> Pin<Box<Sleep>> {
    Box::pin(tokio::time::sleep_until(Instant::now() + delay))
}
