//! Audio subsystem errors

use thiserror::Error;

/// Errors from the capture, playback and device layers
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no audio device available")]
    NoDevice,

    #[error("failed to read device config: {0}")]
    DeviceConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported device sample rate: {0} Hz")]
    UnsupportedRate(u32),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio device is closed")]
    Closed,

    #[error("recorder error: {0}")]
    Recorder(String),
}
