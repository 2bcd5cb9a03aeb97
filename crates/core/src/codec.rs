//! Transport encoding for audio payloads
//!
//! The wire carries PCM16 audio as base64 text next to a mime descriptor.
//! Conversion between f32 samples and PCM16 lives on [`AudioFrame`]
//! (`crate::audio`); this module handles only the transport representation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::{AudioFrame, SampleRate};

/// Malformed inbound payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("empty audio payload")]
    Empty,
}

/// Base64-encoded PCM16 payload plus its mime descriptor
///
/// Transient: one blob per captured block, consumed by the transport send
/// call and dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaBlob {
    /// Base64 text of little-endian PCM16 samples
    pub data: String,
    /// Mime descriptor, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

impl MediaBlob {
    /// Encode an audio frame into its wire representation
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            data: encode_base64(&frame.to_pcm16()),
            mime_type: pcm_mime_type(frame.sample_rate),
        }
    }

    /// Payload size in encoded characters
    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }
}

/// Mime descriptor for raw PCM16 at the given rate
pub fn pcm_mime_type(rate: SampleRate) -> String {
    format!("audio/pcm;rate={}", rate.as_u32())
}

/// Encode bytes as standard base64
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode standard base64 into bytes
///
/// Fails only on malformed input; callers on the inbound audio path drop
/// the offending chunk and continue (the session is never terminated over
/// one bad payload).
pub fn decode_base64(data: &str) -> Result<Bytes, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    BASE64
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Channels;

    #[test]
    fn test_base64_round_trip() {
        let bytes = vec![0x00u8, 0x40, 0xFF, 0x7F];
        let encoded = encode_base64(&bytes);
        let decoded = decode_base64(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), bytes.as_slice());
    }

    #[test]
    fn test_malformed_base64_is_decode_error() {
        let err = decode_base64("not!!valid@@base64").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));

        let err = decode_base64("").unwrap_err();
        assert_eq!(err, DecodeError::Empty);
    }

    #[test]
    fn test_media_blob_from_frame() {
        let frame = AudioFrame::new(vec![0.5; 16], SampleRate::Hz16000, Channels::Mono, 0);
        let blob = MediaBlob::from_frame(&frame);

        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        let decoded = decode_base64(&blob.data).unwrap();
        assert_eq!(decoded.len(), 32); // 16 samples * 2 bytes
    }
}
