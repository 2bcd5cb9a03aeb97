//! Centralized constants for the voice session engine
//!
//! Single source of truth for default values used across the codebase.
//! The core crate cannot depend on this one and mirrors individual values
//! locally with a comment; keep those mirrors in sync with this module.

/// Audio capture and encoding
pub mod audio {
    /// Wire rate for captured audio sent upstream (Hz)
    pub const CAPTURE_RATE: u32 = 16_000;

    /// Rate of audio received from the backend for playback (Hz)
    pub const PLAYBACK_RATE: u32 = 24_000;

    /// Fixed capture block size (frames per block)
    pub const BLOCK_FRAMES: usize = 4096;

    /// Maximum capture backlog before oldest samples are dropped (blocks)
    pub const MAX_BLOCK_BACKLOG: usize = 8;

    /// Quantization scale when converting f32 to PCM16
    pub const PCM16_SCALE: f32 = 32767.0;

    /// Normalization divisor when converting PCM16 to f32
    pub const PCM16_NORMALIZE: f32 = 32768.0;

    /// Gain applied to the RMS volume metric reported to callers
    pub const CAPTURE_GAIN: f32 = 1.6;

    /// Energy floor reported for an all-zero block (dB)
    pub const SILENCE_FLOOR_DB: f32 = -96.0;

    /// Sample rates the device layer accepts
    pub const SUPPORTED_RATES: &[u32] = &[8000, 16000, 22050, 24000, 44100, 48000];
}

/// Playback scheduling
pub mod playback {
    /// How long the scheduler waits after the last buffer completes before
    /// declaring the response finished (ms)
    pub const IDLE_GRACE_MS: u64 = 500;
}

/// Remote backend transport
pub mod transport {
    /// Default WebSocket endpoint (local development)
    pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/v1/live";

    /// Handshake timeout (ms)
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Inbound event channel capacity
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Environment variable holding the backend API key
    pub const API_KEY_ENV: &str = "VOICE_SESSION_API_KEY";
}

/// Tool call dispatch
pub mod tools {
    /// Default tool handler timeout (ms)
    pub const CALL_TIMEOUT_MS: u64 = 30_000;
}
