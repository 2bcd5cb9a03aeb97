//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{audio, playback, tools, transport};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - relaxed validation, warnings only
    #[default]
    Development,
    /// Staging mode - stricter validation
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Runtime environment (development, staging, production)
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Session defaults sent in the setup message
    #[serde(default)]
    pub session: SessionConfig,

    /// Audio capture and playback configuration
    #[serde(default)]
    pub audio: AudioConfig,

    /// Remote backend transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Tool dispatch configuration
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Session defaults advertised to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Voice the backend should synthesize with
    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    /// System instruction for the remote agent
    #[serde(default)]
    pub system_instruction: String,
}

fn default_voice_id() -> String {
    "default".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice_id: default_voice_id(),
            system_instruction: String::new(),
        }
    }
}

/// Which device backend drives capture and playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    /// Real hardware via cpal
    #[default]
    Cpal,
    /// In-process simulated devices (no hardware required)
    Sim,
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Device backend
    #[serde(default)]
    pub backend: AudioBackend,

    /// Wire rate for captured audio (Hz)
    #[serde(default = "default_capture_rate")]
    pub capture_rate: u32,

    /// Playback rate for backend audio (Hz)
    #[serde(default = "default_playback_rate")]
    pub playback_rate: u32,

    /// Fixed capture block size (frames)
    #[serde(default = "default_block_frames")]
    pub block_frames: usize,

    /// Gain applied to the reported volume metric
    #[serde(default = "default_capture_gain")]
    pub capture_gain: f32,

    /// Idle grace window after the last playback buffer (ms)
    #[serde(default = "default_idle_grace_ms")]
    pub idle_grace_ms: u64,

    /// Record played audio to this WAV file when set
    #[serde(default)]
    pub record_path: Option<String>,
}

fn default_capture_rate() -> u32 {
    audio::CAPTURE_RATE
}

fn default_playback_rate() -> u32 {
    audio::PLAYBACK_RATE
}

fn default_block_frames() -> usize {
    audio::BLOCK_FRAMES
}

fn default_capture_gain() -> f32 {
    audio::CAPTURE_GAIN
}

fn default_idle_grace_ms() -> u64 {
    playback::IDLE_GRACE_MS
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::default(),
            capture_rate: default_capture_rate(),
            playback_rate: default_playback_rate(),
            block_frames: default_block_frames(),
            capture_gain: default_capture_gain(),
            idle_grace_ms: default_idle_grace_ms(),
            record_path: None,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint of the backend
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key sent during the handshake
    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,

    /// Handshake timeout (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Inbound event channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_endpoint() -> String {
    transport::DEFAULT_ENDPOINT.to_string()
}

fn default_api_key() -> Option<String> {
    std::env::var(transport::API_KEY_ENV).ok()
}

fn default_connect_timeout_ms() -> u64 {
    transport::CONNECT_TIMEOUT_MS
}

fn default_event_capacity() -> usize {
    transport::EVENT_CHANNEL_CAPACITY
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Tool dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-call handler timeout (ms)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    tools::CALL_TIMEOUT_MS
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_audio()?;
        self.validate_transport()?;
        self.validate_session()?;
        Ok(())
    }

    fn validate_audio(&self) -> Result<(), ConfigError> {
        let a = &self.audio;

        if !a.block_frames.is_power_of_two() || !(256..=16384).contains(&a.block_frames) {
            return Err(ConfigError::InvalidValue {
                field: "audio.block_frames".to_string(),
                message: format!(
                    "Must be a power of two in 256..=16384, got {}",
                    a.block_frames
                ),
            });
        }

        for (field, rate) in [
            ("audio.capture_rate", a.capture_rate),
            ("audio.playback_rate", a.playback_rate),
        ] {
            if !audio::SUPPORTED_RATES.contains(&rate) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("Unsupported sample rate {}", rate),
                });
            }
        }

        if !(0.0..=8.0).contains(&a.capture_gain) {
            return Err(ConfigError::InvalidValue {
                field: "audio.capture_gain".to_string(),
                message: format!("Must be between 0.0 and 8.0, got {}", a.capture_gain),
            });
        }

        if !(50..=5000).contains(&a.idle_grace_ms) {
            return Err(ConfigError::InvalidValue {
                field: "audio.idle_grace_ms".to_string(),
                message: format!("Must be between 50 and 5000, got {}", a.idle_grace_ms),
            });
        }

        Ok(())
    }

    fn validate_transport(&self) -> Result<(), ConfigError> {
        let t = &self.transport;

        if !t.endpoint.starts_with("ws://") && !t.endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidValue {
                field: "transport.endpoint".to_string(),
                message: format!("Must be a ws:// or wss:// URL, got {}", t.endpoint),
            });
        }

        if !(1000..=60_000).contains(&t.connect_timeout_ms) {
            return Err(ConfigError::InvalidValue {
                field: "transport.connect_timeout_ms".to_string(),
                message: format!("Must be between 1000 and 60000, got {}", t.connect_timeout_ms),
            });
        }

        if self.environment.is_production() && t.endpoint.starts_with("ws://") {
            return Err(ConfigError::InvalidValue {
                field: "transport.endpoint".to_string(),
                message: "Production requires a wss:// endpoint".to_string(),
            });
        }

        Ok(())
    }

    fn validate_session(&self) -> Result<(), ConfigError> {
        if self.session.voice_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "session.voice_id".to_string(),
                message: "Must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (VOICE_SESSION_ prefix)
/// 2. config/{env}.toml (if env specified)
/// 3. config/default.toml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    // Load default config
    builder = builder.add_source(File::with_name("config/default").required(false));

    // Load environment-specific config
    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    // Load from environment variables
    builder = builder.add_source(
        Environment::with_prefix("VOICE_SESSION")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    // Validate
    settings.validate()?;

    Ok(settings)
}
