//! Session lifecycle types

use std::sync::Arc;

use voice_session_core::{CloseInfo, TranscriptSegment};

/// Session lifecycle state
///
/// Transitions flow one way per session: a terminal state is left only by
/// a fresh `connect()`. Barge-in does not appear here; an interruption
/// cancels audio and emits [`SessionEvent::Interrupted`] while the session
/// stays `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No hardware or channel resources held
    Idle,
    /// Preparing audio devices, no ownership token claimed yet
    Initializing,
    /// Token claimed, transport handshake in flight
    Connecting,
    /// Duplex streaming in progress
    Active,
    /// Teardown in progress
    Closing,
    /// Ended cleanly
    Closed,
    /// Ended through a device or transport error
    Failed,
}

impl SessionState {
    /// Terminal states are inert until the next `connect()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// What the caller observes over the event channel
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake complete, capture running
    Open,
    /// Partial or final transcript text
    Transcript(TranscriptSegment),
    /// Per-block input volume in [0.0, 1.0], zero while a response plays
    InputLevel(f32),
    /// Response audio was cancelled by barge-in
    Interrupted,
    /// A tool call was handed to the dispatcher
    ToolCallStarted { id: String, name: String },
    /// The session ended
    Closed(CloseInfo),
    /// Contained or fatal error surfaced to the caller
    Error { message: String },
}

/// Per-block volume callback, invoked on the capture task
pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Per-connect overrides and hooks
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Override the configured synthesis voice
    pub voice_id: Option<String>,
    /// Override the configured system instruction
    pub system_instruction: Option<String>,
    /// Raw volume signal, in addition to [`SessionEvent::InputLevel`]
    pub on_volume: Option<VolumeCallback>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("voice_id", &self.voice_id)
            .field("system_instruction", &self.system_instruction)
            .field("on_volume", &self.on_volume.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }
}
