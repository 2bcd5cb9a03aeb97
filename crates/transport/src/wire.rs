//! Wire protocol
//!
//! JSON messages tagged by `type`, snake_case on the wire. Inbound audio
//! arrives base64-encoded inside text frames; [`ServerMessage::into_event`]
//! decodes it so nothing past the transport ever sees base64.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use voice_session_core::{
    decode_base64, CloseInfo, DecodeError, InboundEvent, MediaBlob, ToolCallRequest,
    ToolCallResponse, ToolDeclaration, ToolOutcome, TranscriptSegment,
};

use crate::traits::SessionSetup;

/// Client-to-backend messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection
    Setup {
        voice_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_instruction: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<ToolDeclaration>,
        input_rate: u32,
        output_rate: u32,
    },
    /// One captured audio block
    Audio {
        #[serde(flatten)]
        media: MediaBlob,
    },
    /// Correlated reply to a tool call
    ToolResponse {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Graceful end of session
    EndSession,
}

impl ClientMessage {
    pub fn setup(setup: SessionSetup) -> Self {
        ClientMessage::Setup {
            voice_id: setup.voice_id,
            system_instruction: setup.system_instruction,
            tools: setup.tools,
            input_rate: setup.input_rate,
            output_rate: setup.output_rate,
        }
    }
}

impl From<ToolCallResponse> for ClientMessage {
    fn from(response: ToolCallResponse) -> Self {
        let (result, error) = match response.outcome {
            ToolOutcome::Success(value) => (Some(value), None),
            ToolOutcome::Error(message) => (None, Some(message)),
        };
        ClientMessage::ToolResponse {
            id: response.id,
            name: response.name,
            result,
            error,
        }
    }
}

/// Backend-to-client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement for the setup message
    Ready {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Response audio, base64 PCM16
    Audio {
        data: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// Partial or final transcript
    Transcript {
        #[serde(flatten)]
        segment: TranscriptSegment,
    },
    /// The backend wants a local tool executed
    ToolCall {
        #[serde(flatten)]
        call: ToolCallRequest,
    },
    /// Barge-in: the user started speaking over the response
    Interrupted,
    /// The backend ended the session
    Closed {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        code: Option<u16>,
    },
    /// Channel-level error
    Error { message: String },
}

impl ServerMessage {
    /// Normalize into an [`InboundEvent`]
    ///
    /// `Ready` yields `None`; it belongs to the handshake, not the session
    /// loop. A bad audio payload is the only error path, and callers drop
    /// that single message rather than the session.
    pub fn into_event(self) -> Result<Option<InboundEvent>, DecodeError> {
        let event = match self {
            ServerMessage::Ready { .. } => return Ok(None),
            ServerMessage::Audio { data, .. } => InboundEvent::Audio(decode_base64(&data)?),
            ServerMessage::Transcript { segment } => InboundEvent::Transcript(segment),
            ServerMessage::ToolCall { call } => InboundEvent::ToolCall(call),
            ServerMessage::Interrupted => InboundEvent::Interrupted,
            ServerMessage::Closed { reason, code } => InboundEvent::Closed(CloseInfo::new(
                reason.unwrap_or_else(|| "closed by server".to_string()),
                code,
            )),
            ServerMessage::Error { message } => InboundEvent::Error { message },
        };
        Ok(Some(event))
    }
}
