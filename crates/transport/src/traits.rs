//! Transport abstractions
//!
//! The engine never names a concrete transport. It connects through
//! [`StreamTransport`], writes through the returned [`StreamHandle`] and
//! reads inbound events off the channel, which lets tests substitute a
//! scripted backend for the real WebSocket.

use async_trait::async_trait;
use tokio::sync::mpsc;

use voice_session_config::constants::audio::{CAPTURE_RATE, PLAYBACK_RATE};
use voice_session_core::{InboundEvent, MediaBlob, ToolCallResponse, ToolDeclaration};

use crate::TransportError;

/// Everything the backend needs to start a session
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Requested synthesis voice
    pub voice_id: String,
    /// Optional system prompt for the session
    pub system_instruction: Option<String>,
    /// Tools the client is prepared to execute
    pub tools: Vec<ToolDeclaration>,
    /// Sample rate of the audio the client will send (Hz)
    pub input_rate: u32,
    /// Sample rate the client expects response audio at (Hz)
    pub output_rate: u32,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            system_instruction: None,
            tools: Vec::new(),
            input_rate: CAPTURE_RATE,
            output_rate: PLAYBACK_RATE,
        }
    }
}

/// Counters for an established stream
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub sent_messages: u64,
    pub received_messages: u64,
    /// Inbound messages dropped because they would not parse or decode
    pub decode_failures: u64,
}

/// Write half of an established duplex stream
///
/// Sends are serialized internally; the handle is safe to share.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Send one captured audio block
    async fn send_media(&self, blob: MediaBlob) -> Result<(), TransportError>;

    /// Send the correlated reply to a tool call
    async fn send_tool_response(&self, response: ToolCallResponse) -> Result<(), TransportError>;

    /// Announce the end of the session and close the stream. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Snapshot of the stream counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

impl std::fmt::Debug for dyn StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// Factory for live duplex streams to the backend
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Connect, run the setup handshake and return the established stream
    ///
    /// The receiver yields inbound events in delivery order and ends after
    /// a terminal event.
    async fn connect(
        &self,
        setup: SessionSetup,
    ) -> Result<(Box<dyn StreamHandle>, mpsc::Receiver<InboundEvent>), TransportError>;
}
