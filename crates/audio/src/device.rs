//! Device abstraction for capture and playback
//!
//! The engine never talks to hardware directly; it drives these traits.
//! `crate::cpal` implements them against real devices, `crate::sim`
//! implements them deterministically for tests and hardware-free runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use voice_session_core::{Channels, SampleRate};

use crate::error::AudioError;

/// Identifies one scheduled playback buffer
pub type BufferId = u64;

/// Runnable state of the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Clock advancing, scheduled buffers play
    Running,
    /// Clock halted; `resume()` may bring the device back
    Suspended,
    /// Device torn down; scheduling always fails
    Closed,
}

/// Notifications emitted by an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// A scheduled buffer played to its natural end.
    /// Cancelled buffers never produce this.
    Completed { id: BufferId },
}

/// Speaker-side device: an audio clock plus schedule/cancel primitives
pub trait OutputDevice: Send + Sync {
    /// Current position of the output clock
    fn clock(&self) -> Duration;

    /// Current runnable state
    fn state(&self) -> DeviceState;

    /// Try to bring a suspended device back to `Running`
    fn resume(&self) -> Result<(), AudioError>;

    /// Schedule a buffer to begin playing at `start` on the device clock
    fn schedule(
        &self,
        frame: voice_session_core::AudioFrame,
        start: Duration,
    ) -> Result<BufferId, AudioError>;

    /// Hard-stop a buffer; no completion event is emitted for it
    fn cancel(&self, id: BufferId);

    /// Subscribe to completion events
    fn subscribe(&self) -> broadcast::Receiver<OutputEvent>;
}

/// Microphone-side device producing fixed-size sample blocks
pub trait InputDevice: Send + Sync {
    /// Open the device and start delivering blocks of `block_frames` frames.
    /// The hardware stream stops when the returned [`CaptureStream`] drops.
    fn open(&self, block_frames: usize) -> Result<CaptureStream, AudioError>;
}

/// A live capture stream
///
/// Blocks arrive at the device's native rate and channel layout; the
/// capture encoder normalizes them for the wire.
pub struct CaptureStream {
    /// Native rate of the delivered blocks
    pub sample_rate: SampleRate,
    /// Channel layout of the delivered blocks
    pub channels: Channels,
    /// Fixed-size sample blocks
    pub blocks: mpsc::Receiver<Vec<f32>>,
    stop: Option<Arc<AtomicBool>>,
}

impl CaptureStream {
    /// Stream without a hardware stop signal (simulated devices)
    pub fn new(
        sample_rate: SampleRate,
        channels: Channels,
        blocks: mpsc::Receiver<Vec<f32>>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            blocks,
            stop: None,
        }
    }

    /// Stream that flags `stop` when dropped so the owning device thread
    /// can shut the hardware stream down
    pub fn with_stop(
        sample_rate: SampleRate,
        channels: Channels,
        blocks: mpsc::Receiver<Vec<f32>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            blocks,
            stop: Some(stop),
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}
