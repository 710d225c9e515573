//! Session registry
//!
//! Creates, joins, and leaves logical call sessions and owns the session
//! record. The record is mutated only by backend session-update events and
//! is destroyed on leave; every other component reads snapshots. Without a
//! host bridge the registry degrades to locally synthesized sessions so
//! the client stays usable against no backend.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::events::EventBus;
use crate::host::{HostBridge, HostSession};
use crate::transport::messages::{SessionStatus, SessionUpdatePayload};
use crate::transport::{TransportChannel, TransportEvent};
use crate::{Error, Result};

/// Session event bus capacity
const EVENT_CAPACITY: usize = 16;

/// A logical call between participants
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub participant_count: u32,
}

impl Session {
    fn from_host(host: HostSession) -> Self {
        Self {
            id: host.session_id,
            name: host.name,
            created_at: host.created_at,
            status: SessionStatus::Active,
            participant_count: host.participant_count,
        }
    }

    /// Locally synthesized session used when no host bridge is available
    fn degraded(id: String, name: String) -> Self {
        Self {
            id,
            name,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            participant_count: 1,
        }
    }
}

/// Events published by the registry
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(Session),
    Joined(Session),
    Left,
    Updated(Session),
}

type JoinOutcome = std::result::Result<Session, String>;

struct PendingJoin {
    id: String,
    notify: watch::Sender<Option<JoinOutcome>>,
    outcome: watch::Receiver<Option<JoinOutcome>>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    pending_join: Option<PendingJoin>,
}

/// Creates and tracks the active session
#[derive(Clone)]
pub struct SessionRegistry {
    state: Arc<Mutex<State>>,
    transport: TransportChannel,
    bridge: Option<Arc<dyn HostBridge>>,
    events: EventBus<SessionEvent>,
}

impl SessionRegistry {
    /// Create a registry bound to a transport channel
    ///
    /// Backend session-update messages arriving on the transport are
    /// applied to the session record automatically. Pass `None` for
    /// `bridge` to run without a host environment.
    #[must_use]
    pub fn new(transport: TransportChannel, bridge: Option<Arc<dyn HostBridge>>) -> Self {
        let registry = Self {
            state: Arc::new(Mutex::new(State::default())),
            transport: transport.clone(),
            bridge,
            events: EventBus::new(EVENT_CAPACITY),
        };

        let updates = transport.subscribe();
        let state = Arc::downgrade(&registry.state);
        let events = registry.events.clone();
        tokio::spawn(listen_for_updates(updates, state, events));

        registry
    }

    /// Create a new session and bind the transport to it
    ///
    /// Without a host bridge a locally unique session is synthesized as a
    /// degraded fallback.
    ///
    /// # Errors
    ///
    /// Returns an error when the host-level call fails; no partial session
    /// state remains.
    pub async fn create_session(&self, name: &str) -> Result<Session> {
        let session = match &self.bridge {
            Some(bridge) => {
                let host = bridge
                    .create_session(name)
                    .await
                    .map_err(|e| Error::SessionCreate(e.to_string()))?;
                Session::from_host(host)
            }
            None => {
                tracing::warn!("no host bridge, synthesizing local session");
                let name = if name.is_empty() {
                    "Local Session".to_string()
                } else {
                    name.to_string()
                };
                Session::degraded(
                    format!("session-{}", Utc::now().timestamp_millis()),
                    name,
                )
            }
        };

        tracing::info!(session_id = %session.id, "session created");
        self.bind(session.clone(), SessionEvent::Created(session.clone()))
            .await;
        Ok(session)
    }

    /// Join an existing session and bind the transport to it
    ///
    /// Concurrent joins for the same id are de-duplicated: later callers
    /// await the in-flight request's outcome instead of issuing another.
    ///
    /// # Errors
    ///
    /// Returns an error when the host-level call fails or a join for a
    /// different session is already in flight.
    pub async fn join_session(&self, id: &str) -> Result<Session> {
        let waiter = {
            let mut state = self.locked();
            match &state.pending_join {
                Some(pending) if pending.id == id => Some(pending.outcome.clone()),
                Some(pending) => {
                    return Err(Error::SessionJoin(format!(
                        "join of {} already in progress",
                        pending.id
                    )));
                }
                None => {
                    let (notify, outcome) = watch::channel(None);
                    state.pending_join = Some(PendingJoin {
                        id: id.to_string(),
                        notify,
                        outcome,
                    });
                    None
                }
            }
        };

        if let Some(mut outcome) = waiter {
            loop {
                if let Some(result) = outcome.borrow_and_update().clone() {
                    return result.map_err(Error::SessionJoin);
                }
                if outcome.changed().await.is_err() {
                    return Err(Error::SessionJoin("join request abandoned".to_string()));
                }
            }
        }

        let result = self.perform_join(id).await;

        let shared: JoinOutcome = match &result {
            Ok(session) => Ok(session.clone()),
            Err(Error::SessionJoin(message)) => Err(message.clone()),
            Err(e) => Err(e.to_string()),
        };
        if let Some(pending) = self.locked().pending_join.take() {
            let _ = pending.notify.send(Some(shared));
        }

        result
    }

    async fn perform_join(&self, id: &str) -> Result<Session> {
        let session = match &self.bridge {
            Some(bridge) => {
                let host = bridge
                    .join_session(id)
                    .await
                    .map_err(|e| Error::SessionJoin(e.to_string()))?;
                Session::from_host(host)
            }
            None => {
                tracing::warn!("no host bridge, joining session locally");
                let short: String = id.chars().take(8).collect();
                Session::degraded(id.to_string(), format!("Session {short}"))
            }
        };

        tracing::info!(session_id = %session.id, "session joined");
        self.bind(session.clone(), SessionEvent::Joined(session.clone()))
            .await;
        Ok(session)
    }

    /// Store the session record and connect the transport to it
    ///
    /// A failed initial dial is tolerated; the transport's own retry path
    /// owns connection recovery.
    async fn bind(&self, session: Session, event: SessionEvent) {
        let session_id = session.id.clone();
        self.locked().session = Some(session);
        self.events.emit(event);

        if let Err(e) = self.transport.connect(&session_id).await {
            tracing::warn!(error = %e, session_id = %session_id, "initial connect failed");
        }
    }

    /// Disconnect the transport and clear session state; idempotent
    pub async fn leave_session(&self) {
        let had_session = self.locked().session.take().is_some();
        self.transport.disconnect().await;
        if had_session {
            tracing::info!("session left");
            self.events.emit(SessionEvent::Left);
        }
    }

    /// Apply backend-pushed session metadata; no-op without a session
    pub fn update_session_info(&self, update: &SessionUpdatePayload) {
        apply_update(&self.state, update, &self.events);
    }

    /// True iff a session exists and its status is active
    ///
    /// A session whose status became `ended` counts as left even when it
    /// has not been cleared yet.
    #[must_use]
    pub fn is_in_session(&self) -> bool {
        self.locked()
            .session
            .as_ref()
            .is_some_and(|s| s.status == SessionStatus::Active)
    }

    /// Snapshot of the current session record
    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.locked().session.clone()
    }

    /// Available sessions reported by the host environment
    ///
    /// # Errors
    ///
    /// Returns an error when the host-level call fails.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        match &self.bridge {
            Some(bridge) => Ok(bridge
                .list_sessions()
                .await?
                .into_iter()
                .map(Session::from_host)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Subscribe to registry events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply a session update to the record, if one is active
fn apply_update(
    state: &Mutex<State>,
    update: &SessionUpdatePayload,
    events: &EventBus<SessionEvent>,
) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(session) = state.session.as_mut() else {
        return;
    };
    if session.id != update.session_id {
        tracing::debug!(
            current = %session.id,
            updated = %update.session_id,
            "session update for another session ignored"
        );
        return;
    }

    session.participant_count = update.participants;
    session.status = update.status;
    let snapshot = session.clone();
    drop(state);

    tracing::debug!(
        participants = snapshot.participant_count,
        status = ?snapshot.status,
        "session updated"
    );
    events.emit(SessionEvent::Updated(snapshot));
}

/// Forward transport session-update events into the registry state
async fn listen_for_updates(
    mut updates: broadcast::Receiver<TransportEvent>,
    state: Weak<Mutex<State>>,
    events: EventBus<SessionEvent>,
) {
    loop {
        match updates.recv().await {
            Ok(TransportEvent::SessionUpdate(update)) => {
                let Some(state) = state.upgrade() else { break };
                apply_update(&state, &update, &events);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session update listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
