//! Wire messages exchanged with the backend
//!
//! Structured traffic travels as JSON text frames shaped
//! `{"type": <kind>, "data": <payload>}` in both directions. Binary frames
//! carry raw PCM audio outbound and synthesized speech inbound, with no
//! envelope.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Conversation role negotiated with the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Actively transmitting captured audio
    Speaker,
    /// Receiving and playing synthesized speech
    #[default]
    Listener,
}

impl Role {
    /// The opposite role
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Speaker => Self::Listener,
            Self::Listener => Self::Speaker,
        }
    }
}

/// Negotiated session configuration
///
/// The local copy is the last-written value per field; the backend does not
/// acknowledge it. The full merged configuration is transmitted on every
/// change and again whenever the channel opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

impl SessionConfig {
    /// Merge `partial` into `self`, last write wins per field
    pub fn merge(&mut self, partial: Self) {
        if partial.role.is_some() {
            self.role = partial.role;
        }
        if partial.source_language.is_some() {
            self.source_language = partial.source_language;
        }
        if partial.target_language.is_some() {
            self.target_language = partial.target_language;
        }
    }

    /// True when no field has ever been written
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.role.is_none() && self.source_language.is_none() && self.target_language.is_none()
    }
}

/// Structured messages sent to the backend
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Full merged session configuration
    Config(SessionConfig),
    /// Speech synthesis request
    Tts(TtsRequest),
    /// Keepalive probe
    Ping,
}

/// Speech synthesis request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub language: String,
}

/// Structured messages received from the backend
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Transcript(TranscriptPayload),
    Translation(TranslationPayload),
    SessionUpdate(SessionUpdatePayload),
    Error(ErrorPayload),
    Pong,
}

/// Recognized utterance in its original language
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPayload {
    pub id: String,
    pub text: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_final: bool,
    pub source_language: String,
}

/// Translated text attached to a transcript id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPayload {
    pub id: String,
    pub text: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub source_language: String,
    pub target_language: String,
}

/// Backend-pushed session metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdatePayload {
    pub session_id: String,
    pub participants: u32,
    pub status: SessionStatus,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Backend-reported error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Raw `{type, data}` envelope used to route inbound text frames
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerMessage {
    /// Parse an inbound text frame
    ///
    /// Returns `Ok(None)` for message types this client does not recognize;
    /// those are logged and dropped rather than raised as faults.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame is not a `{type, data}` envelope or
    /// the payload does not match the declared type.
    pub fn parse(text: &str) -> crate::Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let msg = match envelope.kind.as_str() {
            "transcript" => Self::Transcript(serde_json::from_value(envelope.data)?),
            "translation" => Self::Translation(serde_json::from_value(envelope.data)?),
            "session_update" => Self::SessionUpdate(serde_json::from_value(envelope.data)?),
            "error" => Self::Error(serde_json::from_value(envelope.data)?),
            "pong" => Self::Pong,
            other => {
                tracing::debug!(kind = other, "unrecognized message type dropped");
                return Ok(None);
            }
        };
        Ok(Some(msg))
    }
}

/// Accept RFC 3339 timestamps as well as naive ISO 8601 (assumed UTC)
///
/// The backend emits `datetime.isoformat()` style values without a zone
/// designator depending on its host platform.
pub(crate) fn flexible_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}
