//! Audio device and scheduling layer
//!
//! Everything between raw device callbacks and the session engine:
//!
//! - Device abstractions with a sample-accurate output clock
//! - Gapless playback scheduling with hard interruption
//! - Microphone capture, block assembly and wire encoding
//! - Exclusive device ownership arbitration
//! - Hardware (cpal), simulated and WAV-recording backends
//!
//! The scheduler and encoder are backend-agnostic; they only see the
//! [`OutputDevice`] and [`InputDevice`] traits.

pub mod arbiter;
pub mod capture;
pub mod cpal;
pub mod device;
pub mod error;
pub mod playback;
pub mod recorder;
pub mod sim;

// Device abstractions
pub use device::{
    BufferId, CaptureStream, DeviceState, InputDevice, OutputDevice, OutputEvent,
};
pub use error::AudioError;

// Scheduling and capture pipelines
pub use capture::{CaptureConfig, CaptureEncoder, CaptureStats};
pub use playback::{PlaybackScheduler, PlaybackStats};

// Ownership arbitration
pub use arbiter::{DeviceArbiter, OwnerId, OwnershipToken};

// Backends
pub use crate::cpal::{CpalInput, CpalOutput};
pub use recorder::RecordingOutput;
pub use sim::{SimInput, SimOutput};
