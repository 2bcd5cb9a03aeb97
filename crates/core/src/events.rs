//! Session event types
//!
//! `InboundEvent` is the tagged union every remote message is normalized
//! into before it reaches the session loop. Events arrive in transport
//! delivery order and are consumed exactly once.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a transcript segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    #[default]
    User,
    Agent,
}

/// A partial or final transcript segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
    #[serde(default)]
    pub speaker: Speaker,
}

/// A function invocation requested by the remote backend
///
/// The id correlates the eventual response; the remote side is awaiting it
/// and will stall without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Outcome of a local tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

/// Correlated reply to a [`ToolCallRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResponse {
    pub fn ok(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Success(result),
        }
    }

    pub fn error(id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }
}

/// A tool advertised to the remote backend in the session setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// JSON Schema for the arguments, when the handler declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Why the remote channel ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl CloseInfo {
    pub fn new(reason: impl Into<String>, code: Option<u16>) -> Self {
        Self {
            reason: reason.into(),
            code,
        }
    }
}

/// Normalized inbound message from the remote backend
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Decoded PCM16 audio (little-endian), ready for playback scheduling
    Audio(Bytes),
    /// Partial or final transcript text
    Transcript(TranscriptSegment),
    /// The backend is invoking a local tool
    ToolCall(ToolCallRequest),
    /// Barge-in: stop all queued and playing audio now
    Interrupted,
    /// The backend closed the channel
    Closed(CloseInfo),
    /// Channel-level error reported by the backend
    Error { message: String },
}

impl InboundEvent {
    /// Terminal events end the session loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboundEvent::Closed(_) | InboundEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_response_constructors() {
        let ok = ToolCallResponse::ok("abc", "lookup", json!({"result": 42}));
        assert_eq!(ok.id, "abc");
        assert_eq!(ok.outcome, ToolOutcome::Success(json!({"result": 42})));

        let err = ToolCallResponse::error("abc", "ghost", "unknown tool");
        assert_eq!(err.id, "abc");
        assert!(matches!(err.outcome, ToolOutcome::Error(_)));
    }

    #[test]
    fn test_terminal_events() {
        assert!(InboundEvent::Closed(CloseInfo::new("bye", Some(1000))).is_terminal());
        assert!(InboundEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
        assert!(!InboundEvent::Interrupted.is_terminal());
    }

    #[test]
    fn test_transcript_defaults() {
        let seg: TranscriptSegment =
            serde_json::from_value(json!({"text": "hello", "is_final": false})).unwrap();
        assert_eq!(seg.speaker, Speaker::User);
    }
}
