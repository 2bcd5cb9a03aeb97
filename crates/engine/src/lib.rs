//! Duplex voice session engine
//!
//! Orchestrates one live conversation with a remote voice backend:
//! microphone capture streams up while response audio, transcripts, tool
//! calls and barge-in signals stream down. The engine owns the lifecycle
//! (`Idle → Initializing → Connecting → Active → Closing → Closed/Failed`),
//! mediates exclusive device ownership and guarantees exactly-once cleanup.

pub mod engine;
pub mod state;

use thiserror::Error;

use voice_session_audio::AudioError;
use voice_session_config::ConfigError;
use voice_session_transport::TransportError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("no active session")]
    NotConnected,

    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("session evicted by another claimant")]
    Evicted,

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedRate(u32),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub use engine::{EngineStats, VoiceSessionEngine};
pub use state::{ConnectOptions, SessionEvent, SessionState, VolumeCallback};
