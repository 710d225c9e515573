//! Babelcall - real-time bilingual call translation client
//!
//! Client-side core of a call-translation application: microphone audio is
//! captured, leveled, and streamed to a backend that performs recognition,
//! translation, and speech synthesis; synthesized speech and the
//! transcript/translation stream come back over the same channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      UI / CLI                        │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ events / snapshots
//! ┌────────────────────────▼─────────────────────────────┐
//! │              Conversation Orchestrator               │
//! │   role gating │ transcript ledger │ TTS playback     │
//! └───────┬──────────────────┬───────────────────┬───────┘
//!         │                  │                   │
//! ┌───────▼───────┐  ┌───────▼────────┐  ┌───────▼───────┐
//! │ Audio Capture │  │   Transport    │  │    Session    │
//! │ cpal · levels │  │ WS · reconnect │  │ REST · record │
//! └───────────────┘  └────────────────┘  └───────────────┘
//! ```
//!
//! Each capability is a component owning its private state, constructed
//! once and passed by handle; there is no ambient global lookup.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod host;
pub mod session;
pub mod transport;

pub use audio::{
    AudioLevel, CaptureEngine, CaptureSource, LevelMeter, Playback, PlaybackSink, SAMPLE_RATE,
    decode_synthesized, encode_pcm,
};
pub use config::ClientConfig;
pub use conversation::{
    ConversationEvent, ConversationOrchestrator, ConversationState, Role, TranscriptItem,
};
pub use error::{Error, Result};
pub use events::EventBus;
pub use host::{HostBridge, HostSession, HttpBridge};
pub use session::{Session, SessionEvent, SessionRegistry};
pub use transport::messages::{SessionConfig, SessionStatus};
pub use transport::socket::{Connection, Connector, WireFrame, WsConnector};
pub use transport::{
    LinkStatus, RetryPolicy, TransportChannel, TransportConfig, TransportError, TransportEvent,
};
