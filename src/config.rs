//! Client configuration
//!
//! Everything is defaulted for a local backend and overridable through
//! `BABELCALL_*` environment variables; the CLI layers its flags on top.

use std::time::Duration;

use url::Url;

use crate::transport::{RetryPolicy, TransportConfig};
use crate::{Error, Result};

/// Default backend REST address
const DEFAULT_HTTP_URL: &str = "http://localhost:8000";

/// Default backend WebSocket address; session ids are appended as a path
/// segment
const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

/// Default language pair
const DEFAULT_SOURCE_LANGUAGE: &str = "en";
const DEFAULT_TARGET_LANGUAGE: &str = "es";

/// Minimum gap between consecutive audio frame sends
const DRAIN_GAP: Duration = Duration::from_millis(10);

/// Keepalive ping period while the channel is open
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend REST base address
    pub http_url: Url,
    /// Backend WebSocket base address
    pub ws_url: Url,
    /// Language spoken by the local participant
    pub source_language: String,
    /// Language spoken by the remote participant
    pub target_language: String,
    /// Initial microphone gain, clamped to [0, 2] when applied
    pub gain: f32,
    /// Reconnect behavior on unexpected close
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_url: Url::parse(DEFAULT_HTTP_URL).expect("default http url parses"),
            ws_url: Url::parse(DEFAULT_WS_URL).expect("default ws url parses"),
            source_language: DEFAULT_SOURCE_LANGUAGE.to_string(),
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
            gain: 1.0,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `BABELCALL_HTTP_URL`, `BABELCALL_WS_URL`,
    /// `BABELCALL_SOURCE_LANG`, `BABELCALL_TARGET_LANG`, and
    /// `BABELCALL_GAIN`, defaulting each missing variable.
    ///
    /// # Errors
    ///
    /// Returns an error when a provided URL does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("BABELCALL_HTTP_URL") {
            config.http_url = parse_url("BABELCALL_HTTP_URL", &raw)?;
        }
        if let Ok(raw) = std::env::var("BABELCALL_WS_URL") {
            config.ws_url = parse_url("BABELCALL_WS_URL", &raw)?;
        }
        if let Ok(lang) = std::env::var("BABELCALL_SOURCE_LANG") {
            config.source_language = lang;
        }
        if let Ok(lang) = std::env::var("BABELCALL_TARGET_LANG") {
            config.target_language = lang;
        }
        if let Some(gain) = std::env::var("BABELCALL_GAIN")
            .ok()
            .and_then(|raw| raw.parse::<f32>().ok())
        {
            config.gain = gain;
        }

        Ok(config)
    }

    /// Transport channel configuration derived from this client config
    #[must_use]
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.ws_url.clone(),
            retry: self.retry,
            drain_gap: DRAIN_GAP,
            keepalive: KEEPALIVE,
        }
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("{name} `{raw}`: {e}")))
}
