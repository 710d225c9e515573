//! Host environment bridge
//!
//! The desktop shell exposes a small request/response surface: session
//! create/join/list against the backend's REST API, transcript export to
//! disk, and audio device enumeration. The core treats it as a black box
//! behind [`HostBridge`]; components constructed without a bridge degrade
//! to in-memory behavior instead of failing hard.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Deserialize;
use url::Url;

use crate::conversation::TranscriptItem;
use crate::{Error, Result};

/// Session record as reported by the host environment
#[derive(Debug, Clone, Deserialize)]
pub struct HostSession {
    pub session_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(deserialize_with = "crate::transport::messages::flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default)]
    pub max_participants: u32,
}

/// Request/response surface of the host environment
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// Create a new session
    ///
    /// # Errors
    ///
    /// Returns an error when the host-level call fails.
    async fn create_session(&self, name: &str) -> Result<HostSession>;

    /// Join an existing session by id
    ///
    /// # Errors
    ///
    /// Returns an error when the session does not exist or is full.
    async fn join_session(&self, id: &str) -> Result<HostSession>;

    /// List joinable sessions
    ///
    /// # Errors
    ///
    /// Returns an error when the host-level call fails.
    async fn list_sessions(&self) -> Result<Vec<HostSession>>;

    /// Export transcript items to a file, returning the written path
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    async fn export_transcript(&self, items: &[TranscriptItem], path: &Path) -> Result<PathBuf>;

    /// Names of available audio input devices
    ///
    /// # Errors
    ///
    /// Returns an error when the audio host cannot be queried.
    fn audio_devices(&self) -> Result<Vec<String>>;
}

/// Host bridge backed by the backend's REST API and the local machine
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: HostSession,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    sessions: Vec<HostSession>,
}

impl HttpBridge {
    /// Create a bridge against the backend at `base_url`
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[async_trait]
impl HostBridge for HttpBridge {
    async fn create_session(&self, name: &str) -> Result<HostSession> {
        let response: SessionResponse = self
            .client
            .post(self.endpoint("sessions"))
            .query(&[("name", name)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(session_id = %response.session.session_id, "session created via host");
        Ok(response.session)
    }

    async fn join_session(&self, id: &str) -> Result<HostSession> {
        let sessions = self.list_sessions().await?;
        sessions
            .into_iter()
            .find(|s| s.session_id == id)
            .ok_or_else(|| Error::Host(format!("session {id} not found or full")))
    }

    async fn list_sessions(&self) -> Result<Vec<HostSession>> {
        let response: SessionsResponse = self
            .client
            .get(self.endpoint("sessions"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.sessions)
    }

    async fn export_transcript(&self, items: &[TranscriptItem], path: &Path) -> Result<PathBuf> {
        export_to_file(items, path).await
    }

    fn audio_devices(&self) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

/// Write transcript items to `path` as pretty-printed JSON
///
/// # Errors
///
/// Returns an error when serialization or the write fails.
pub async fn export_to_file(items: &[TranscriptItem], path: &Path) -> Result<PathBuf> {
    let json = serde_json::to_vec_pretty(items)?;
    tokio::fs::write(path, json).await?;
    tracing::info!(path = %path.display(), items = items.len(), "transcript exported");
    Ok(path.to_path_buf())
}
