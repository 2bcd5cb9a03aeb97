//! Configuration management for the voice session engine
//!
//! Supports loading configuration from:
//! - TOML files (config/default.toml, config/{env}.toml)
//! - Environment variables (VOICE_SESSION_ prefix)

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, AudioBackend, AudioConfig, ObservabilityConfig, RuntimeEnvironment,
    SessionConfig, Settings, ToolsConfig, TransportConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
