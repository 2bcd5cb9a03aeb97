//! Core types for the voice session engine
//!
//! This crate provides the foundational types used across all other crates:
//! - Audio frame types, PCM16 conversion and resampling
//! - Transport encoding for audio payloads (base64 + mime)
//! - Inbound session events and tool call types
//!
//! It stays free of device, transport and config concerns so every other
//! crate can depend on it.

pub mod audio;
pub mod codec;
pub mod events;

pub use audio::{AudioFrame, BlockAssembler, Channels, SampleRate};
pub use codec::{decode_base64, encode_base64, pcm_mime_type, DecodeError, MediaBlob};
pub use events::{
    CloseInfo, InboundEvent, Speaker, ToolCallRequest, ToolCallResponse, ToolDeclaration,
    ToolOutcome, TranscriptSegment,
};
