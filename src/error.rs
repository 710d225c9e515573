//! Error types for the babelcall client core

use thiserror::Error;

/// Result type alias for babelcall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the babelcall client
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone acquisition failed. Retrying without new user
    /// permission will fail again.
    #[error("audio init error: {0}")]
    AudioInit(String),

    /// Capture engine used before `initialize` completed
    #[error("audio engine not initialized")]
    NotInitialized,

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Role transition failed; the previous role remains in effect
    #[error("role change failed: {0}")]
    RoleChange(String),

    /// Conversation operation requires an active session
    #[error("not in an active session")]
    NotInSession,

    /// Session creation failed
    #[error("session create failed: {0}")]
    SessionCreate(String),

    /// Session join failed
    #[error("session join failed: {0}")]
    SessionJoin(String),

    /// Transport channel error
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed message or undecodable synthesized audio
    #[error("decode error: {0}")]
    Decode(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Host bridge error
    #[error("host bridge error: {0}")]
    Host(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
