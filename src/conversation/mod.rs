//! Conversation orchestrator
//!
//! The central state machine of a call: binds capture output to the
//! transport while the local participant speaks, folds inbound transcript
//! and translation messages into the transcript ledger, and plays
//! synthesized speech through the exclusive output. Consumers observe the
//! conversation through immutable [`ConversationState`] snapshots; the
//! ledger itself is never handed out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioLevel, CaptureSource, PlaybackSink};
use crate::events::EventBus;
use crate::session::SessionRegistry;
use crate::transport::messages::{SessionConfig, TranscriptPayload, TranslationPayload};
use crate::transport::{LinkStatus, TransportChannel, TransportEvent};
use crate::{Error, Result};

pub use crate::transport::messages::Role;

/// Conversation event bus capacity
const EVENT_CAPACITY: usize = 64;

/// One recognized utterance and, once it arrives, its translation
///
/// Identity is the backend-assigned `id`, stable across the
/// transcript/translation message pair. Items are never deleted during a
/// session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptItem {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_self: bool,
    pub is_final: bool,
    pub source_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

/// Derived snapshot of the conversation
///
/// Transcripts are ordered by timestamp, not by arrival order.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub role: Role,
    pub is_active: bool,
    pub source_language: String,
    pub target_language: String,
    pub transcripts: Vec<TranscriptItem>,
    pub current_level: AudioLevel,
}

/// Events published by the orchestrator
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChanged(ConversationState),
    RoleChanged(Role),
    TranscriptReceived(TranscriptItem),
    TranslationReceived(TranscriptItem),
    Level(AudioLevel),
}

struct Inner {
    role: Role,
    is_active: bool,
    source_language: String,
    target_language: String,
    ledger: HashMap<String, TranscriptItem>,
    current_level: AudioLevel,
    capture: Box<dyn CaptureSource>,
    disposed: bool,
}

impl Inner {
    fn snapshot(&self) -> ConversationState {
        let mut transcripts: Vec<TranscriptItem> = self.ledger.values().cloned().collect();
        transcripts.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        ConversationState {
            role: self.role,
            is_active: self.is_active,
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
            transcripts,
            current_level: self.current_level,
        }
    }
}

/// Orchestrates one conversation over a session
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<Mutex<Inner>>,
    transport: TransportChannel,
    registry: SessionRegistry,
    events: EventBus<ConversationEvent>,
    shutdown: CancellationToken,
}

impl ConversationOrchestrator {
    /// Wire the orchestrator to its collaborators and start its pump
    ///
    /// Takes exclusive ownership of the capture source and the playback
    /// sink. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        registry: SessionRegistry,
        transport: TransportChannel,
        mut capture: Box<dyn CaptureSource>,
        playback: Box<dyn PlaybackSink>,
        source_language: String,
        target_language: String,
    ) -> Self {
        let frames = capture.take_frames().unwrap_or_else(|| {
            // Receiver already taken elsewhere: run without a frame path
            let (_, rx) = mpsc::channel(1);
            rx
        });
        let levels = capture.levels();
        let transport_events = transport.subscribe();

        let inner = Arc::new(Mutex::new(Inner {
            role: Role::Listener,
            is_active: false,
            source_language,
            target_language,
            ledger: HashMap::new(),
            current_level: AudioLevel::default(),
            capture,
            disposed: false,
        }));
        let events = EventBus::new(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(pump(
            Arc::clone(&inner),
            transport.clone(),
            playback,
            frames,
            levels,
            transport_events,
            events.clone(),
            shutdown.clone(),
        ));

        Self {
            inner,
            transport,
            registry,
            events,
            shutdown,
        }
    }

    /// Begin the conversation as listener
    ///
    /// # Errors
    ///
    /// Returns an error when no active session exists.
    pub async fn start(&self) -> Result<()> {
        if !self.registry.is_in_session() {
            return Err(Error::NotInSession);
        }

        let config = {
            let mut inner = self.locked();
            inner.capture.stop_recording();
            inner.role = Role::Listener;
            inner.is_active = true;
            SessionConfig {
                role: Some(Role::Listener),
                source_language: Some(inner.source_language.clone()),
                target_language: Some(inner.target_language.clone()),
            }
        };
        self.transport.send_config(config).await;

        tracing::info!("conversation started");
        self.emit_state();
        Ok(())
    }

    /// Halt capture and clear the active flag; idempotent
    pub fn stop(&self) {
        let stopped = {
            let mut inner = self.locked();
            if inner.is_active {
                inner.is_active = false;
                inner.capture.stop_recording();
                true
            } else {
                false
            }
        };
        if stopped {
            tracing::info!("conversation stopped");
            self.emit_state();
        }
    }

    /// Switch between speaker and listener
    ///
    /// Moving to speaker starts audio capture; moving to listener stops
    /// it. The new role is pushed to the backend through the transport's
    /// configuration path.
    ///
    /// # Errors
    ///
    /// Returns an error when capture cannot start; the previous role
    /// remains in effect.
    pub async fn set_role(&self, role: Role) -> Result<()> {
        {
            let mut inner = self.locked();
            if inner.role == role {
                return Ok(());
            }
            if role == Role::Speaker {
                inner
                    .capture
                    .initialize()
                    .map_err(|e| Error::RoleChange(e.to_string()))?;
                inner
                    .capture
                    .start_recording()
                    .map_err(|e| Error::RoleChange(e.to_string()))?;
            } else {
                inner.capture.stop_recording();
            }
            inner.role = role;
        }

        self.transport
            .send_config(SessionConfig {
                role: Some(role),
                ..SessionConfig::default()
            })
            .await;

        tracing::info!(role = ?role, "role changed");
        self.events.emit(ConversationEvent::RoleChanged(role));
        self.emit_state();
        Ok(())
    }

    /// Flip between speaker and listener
    ///
    /// # Errors
    ///
    /// Returns an error when the transition fails, as for `set_role`.
    pub async fn toggle_role(&self) -> Result<()> {
        let next = self.locked().role.flipped();
        self.set_role(next).await
    }

    /// Update language preferences and push them to the backend
    ///
    /// Takes effect for subsequently captured and received content only.
    pub async fn set_languages(&self, source: &str, target: &str) {
        {
            let mut inner = self.locked();
            inner.source_language = source.to_string();
            inner.target_language = target.to_string();
        }
        self.transport
            .send_config(SessionConfig {
                role: None,
                source_language: Some(source.to_string()),
                target_language: Some(target.to_string()),
            })
            .await;
        tracing::info!(source, target, "languages changed");
        self.emit_state();
    }

    /// Set microphone gain, clamped to [0, 2]
    pub fn set_gain(&self, value: f32) {
        self.locked().capture.set_gain(value);
    }

    /// Current conversation snapshot
    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.locked().snapshot()
    }

    /// Current role
    #[must_use]
    pub fn role(&self) -> Role {
        self.locked().role
    }

    /// True while the conversation is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.locked().is_active
    }

    /// Subscribe to conversation events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Write the transcript ledger, in timestamp order, to a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub async fn export_transcript(&self, path: &Path) -> Result<PathBuf> {
        let items = self.state().transcripts;
        crate::host::export_to_file(&items, path).await
    }

    /// Stop the conversation and release audio resources; idempotent
    pub fn dispose(&self) {
        self.shutdown.cancel();
        let mut inner = self.locked();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.is_active = false;
        inner.capture.stop_recording();
        inner.capture.dispose();
        tracing::debug!("conversation disposed");
    }

    fn emit_state(&self) {
        let snapshot = self.locked().snapshot();
        self.events.emit(ConversationEvent::StateChanged(snapshot));
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event pump: forwards gated capture frames, ingests inbound messages,
/// and mirrors transport status into the conversation
#[allow(clippy::too_many_arguments)]
async fn pump(
    inner: Arc<Mutex<Inner>>,
    transport: TransportChannel,
    mut playback: Box<dyn PlaybackSink>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut levels: broadcast::Receiver<AudioLevel>,
    mut transport_events: broadcast::Receiver<TransportEvent>,
    events: EventBus<ConversationEvent>,
    shutdown: CancellationToken,
) {
    let mut frames_open = true;
    let mut levels_open = true;
    let mut transport_open = true;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            maybe_frame = frames.recv(), if frames_open => match maybe_frame {
                Some(frame) => {
                    // Capture and transmission are gated independently:
                    // frames outside the active-speaker window are discarded
                    let forward = {
                        let inner = lock(&inner);
                        inner.is_active && inner.role == Role::Speaker
                    };
                    if forward {
                        transport.send_audio(frame).await;
                    }
                }
                None => frames_open = false,
            },
            level = levels.recv(), if levels_open => match level {
                Ok(level) => {
                    lock(&inner).current_level = level;
                    events.emit(ConversationEvent::Level(level));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => levels_open = false,
            },
            event = transport_events.recv(), if transport_open => match event {
                Ok(event) => on_transport_event(event, &inner, playback.as_mut(), &events).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "conversation pump lagged behind transport");
                }
                Err(broadcast::error::RecvError::Closed) => transport_open = false,
            },
        }
    }
}

async fn on_transport_event(
    event: TransportEvent,
    inner: &Arc<Mutex<Inner>>,
    playback: &mut dyn PlaybackSink,
    events: &EventBus<ConversationEvent>,
) {
    match event {
        TransportEvent::Transcript(payload) => ingest_transcript(inner, payload, events),
        TransportEvent::Translation(payload) => ingest_translation(inner, &payload, events),
        TransportEvent::SynthesizedAudio(audio) => {
            if let Err(e) = playback.play(&audio).await {
                tracing::warn!(error = %e, "synthesized audio not played");
            }
        }
        TransportEvent::Status(status) => mirror_status(status, inner, events),
        TransportEvent::SessionUpdate(_) => {}
        TransportEvent::Error(error) => {
            tracing::debug!(code = %error.code, message = %error.message, "transport error observed");
        }
    }
}

/// Store a transcript, tagged with the role held at the time of receipt
fn ingest_transcript(
    inner: &Arc<Mutex<Inner>>,
    payload: TranscriptPayload,
    events: &EventBus<ConversationEvent>,
) {
    let (item, snapshot) = {
        let mut inner = lock(inner);
        let is_self = inner.role == Role::Speaker;
        let item = match inner.ledger.get_mut(&payload.id) {
            // Streaming recognition revises an utterance in place
            Some(existing) => {
                existing.text = payload.text;
                existing.is_final = payload.is_final;
                existing.clone()
            }
            None => {
                let item = TranscriptItem {
                    id: payload.id.clone(),
                    text: payload.text,
                    translation: None,
                    timestamp: payload.timestamp,
                    is_self,
                    is_final: payload.is_final,
                    source_language: payload.source_language,
                    target_language: None,
                };
                inner.ledger.insert(payload.id, item.clone());
                item
            }
        };
        (item, inner.snapshot())
    };

    tracing::debug!(id = %item.id, is_self = item.is_self, "transcript received");
    events.emit(ConversationEvent::TranscriptReceived(item));
    events.emit(ConversationEvent::StateChanged(snapshot));
}

/// Attach a translation to its transcript; orphans are dropped
fn ingest_translation(
    inner: &Arc<Mutex<Inner>>,
    payload: &TranslationPayload,
    events: &EventBus<ConversationEvent>,
) {
    let updated = {
        let mut inner = lock(inner);
        let item = match inner.ledger.get_mut(&payload.id) {
            Some(item) => {
                item.translation = Some(payload.text.clone());
                item.target_language = Some(payload.target_language.clone());
                Some(item.clone())
            }
            None => None,
        };
        item.map(|item| (item, inner.snapshot()))
    };

    match updated {
        Some((item, snapshot)) => {
            tracing::debug!(id = %item.id, "translation received");
            events.emit(ConversationEvent::TranslationReceived(item));
            events.emit(ConversationEvent::StateChanged(snapshot));
        }
        None => {
            tracing::debug!(id = %payload.id, "orphan translation dropped");
        }
    }
}

/// Force-stop the conversation when the channel closes underneath it
fn mirror_status(
    status: LinkStatus,
    inner: &Arc<Mutex<Inner>>,
    events: &EventBus<ConversationEvent>,
) {
    let closed = matches!(
        status,
        LinkStatus::ClosedRetrying | LinkStatus::ClosedExhausted | LinkStatus::Disconnected
    );
    if !closed {
        return;
    }

    let snapshot = {
        let mut inner = lock(inner);
        if !inner.is_active {
            return;
        }
        inner.is_active = false;
        inner.capture.stop_recording();
        inner.snapshot()
    };

    tracing::warn!(status = ?status, "connection lost, conversation stopped");
    events.emit(ConversationEvent::StateChanged(snapshot));
}

fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
