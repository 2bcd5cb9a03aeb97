//! Remote backend transport
//!
//! Owns the duplex stream to the voice backend: dialing, the setup/ready
//! handshake, outbound audio and tool responses, and normalization of
//! inbound frames into session events. The engine programs against the
//! [`StreamTransport`] and [`StreamHandle`] traits only.

pub mod traits;
pub mod wire;
pub mod ws;

use thiserror::Error;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session closed")]
    SessionClosed,
}

// Abstractions
pub use traits::{SessionSetup, StreamHandle, StreamTransport, TransportStats};

// Wire protocol
pub use wire::{ClientMessage, ServerMessage};

// WebSocket implementation
pub use ws::{WsConfig, WsTransport};
