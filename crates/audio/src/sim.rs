//! Simulated devices with a manually driven clock
//!
//! Used by tests and by the `sim` audio backend, which runs a full session
//! without touching hardware. The output clock only moves when [`SimOutput::advance`]
//! is called, which makes scheduling behaviour deterministic.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use voice_session_core::{AudioFrame, Channels, SampleRate};

use crate::device::{
    BufferId, CaptureStream, DeviceState, InputDevice, OutputDevice, OutputEvent,
};
use crate::error::AudioError;

/// One `schedule` call as the device saw it
#[derive(Debug, Clone, PartialEq)]
pub struct SimSchedule {
    pub id: BufferId,
    pub start: Duration,
    pub duration: Duration,
}

struct ActiveBuffer {
    id: BufferId,
    end: Duration,
}

/// Output device whose clock is advanced by hand
pub struct SimOutput {
    clock: Mutex<Duration>,
    state: Mutex<DeviceState>,
    active: Mutex<Vec<ActiveBuffer>>,
    schedule_log: Mutex<Vec<SimSchedule>>,
    cancelled: Mutex<Vec<BufferId>>,
    resume_calls: AtomicU64,
    resume_fails: AtomicBool,
    next_id: AtomicU64,
    events: broadcast::Sender<OutputEvent>,
}

impl SimOutput {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            clock: Mutex::new(Duration::ZERO),
            state: Mutex::new(DeviceState::Running),
            active: Mutex::new(Vec::new()),
            schedule_log: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            resume_calls: AtomicU64::new(0),
            resume_fails: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            events,
        })
    }

    /// Move the clock forward and retire every buffer that ends by then
    pub fn advance(&self, dt: Duration) {
        let now = {
            let mut clock = self.clock.lock();
            *clock += dt;
            *clock
        };

        let finished: Vec<BufferId> = {
            let mut active = self.active.lock();
            let (done, rest): (Vec<_>, Vec<_>) =
                active.drain(..).partition(|buffer| buffer.end <= now);
            *active = rest;
            done.into_iter().map(|buffer| buffer.id).collect()
        };

        for id in finished {
            let _ = self.events.send(OutputEvent::Completed { id });
        }
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn set_resume_fails(&self, fails: bool) {
        self.resume_fails.store(fails, Ordering::SeqCst);
    }

    pub fn resume_calls(&self) -> u64 {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Every `schedule` call in order, including since-cancelled buffers
    pub fn schedule_log(&self) -> Vec<SimSchedule> {
        self.schedule_log.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<BufferId> {
        self.cancelled.lock().clone()
    }

    /// Buffers scheduled but neither retired nor cancelled
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl OutputDevice for SimOutput {
    fn clock(&self) -> Duration {
        *self.clock.lock()
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        if self.resume_fails.load(Ordering::SeqCst) {
            return Err(AudioError::Device("simulated resume failure".into()));
        }
        *self.state.lock() = DeviceState::Running;
        Ok(())
    }

    fn schedule(&self, frame: AudioFrame, start: Duration) -> Result<BufferId, AudioError> {
        if *self.state.lock() == DeviceState::Closed {
            return Err(AudioError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let duration = frame.duration;
        self.schedule_log.lock().push(SimSchedule { id, start, duration });
        self.active.lock().push(ActiveBuffer { id, end: start + duration });
        Ok(id)
    }

    fn cancel(&self, id: BufferId) {
        let mut active = self.active.lock();
        if let Some(pos) = active.iter().position(|buffer| buffer.id == id) {
            active.remove(pos);
            self.cancelled.lock().push(id);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.events.subscribe()
    }
}

/// Input device fed by the test instead of a microphone
pub struct SimInput {
    sample_rate: SampleRate,
    channels: Channels,
    feeder: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    stopped: Arc<AtomicBool>,
    opened_with: Mutex<Option<usize>>,
}

impl SimInput {
    pub fn new(sample_rate: SampleRate) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            channels: Channels::Mono,
            feeder: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            opened_with: Mutex::new(None),
        })
    }

    /// Push one block into the open stream. Returns false when no stream is
    /// open or its channel is full or gone.
    pub fn feed(&self, block: Vec<f32>) -> bool {
        let feeder = self.feeder.lock();
        match feeder.as_ref() {
            Some(tx) => tx.try_send(block).is_ok(),
            None => false,
        }
    }

    /// Whether the last opened stream has been dropped
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Block size requested by the most recent `open`
    pub fn opened_block_frames(&self) -> Option<usize> {
        *self.opened_with.lock()
    }
}

impl InputDevice for SimInput {
    fn open(&self, block_frames: usize) -> Result<CaptureStream, AudioError> {
        let (tx, rx) = mpsc::channel(64);
        *self.feeder.lock() = Some(tx);
        *self.opened_with.lock() = Some(block_frames);
        self.stopped.store(false, Ordering::Release);
        Ok(CaptureStream::with_stop(
            self.sample_rate,
            self.channels,
            rx,
            Arc::clone(&self.stopped),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_ms(ms: u64) -> AudioFrame {
        let samples = vec![0.0f32; SampleRate::Hz24000.samples_per_ms() * ms as usize];
        AudioFrame::new(samples, SampleRate::Hz24000, Channels::Mono, 0)
    }

    #[tokio::test]
    async fn test_advance_retires_due_buffers_in_order() {
        let output = SimOutput::new();
        let mut events = output.subscribe();

        let a = output.schedule(frame_ms(100), Duration::ZERO).unwrap();
        let b = output
            .schedule(frame_ms(100), Duration::from_millis(100))
            .unwrap();

        output.advance(Duration::from_millis(150));
        assert_eq!(events.recv().await.unwrap(), OutputEvent::Completed { id: a });
        assert_eq!(output.active_count(), 1);

        output.advance(Duration::from_millis(100));
        assert_eq!(events.recv().await.unwrap(), OutputEvent::Completed { id: b });
        assert_eq!(output.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_buffer_never_completes() {
        let output = SimOutput::new();
        let mut events = output.subscribe();

        let a = output.schedule(frame_ms(100), Duration::ZERO).unwrap();
        let b = output
            .schedule(frame_ms(100), Duration::from_millis(100))
            .unwrap();
        output.cancel(a);

        output.advance(Duration::from_millis(300));
        assert_eq!(events.recv().await.unwrap(), OutputEvent::Completed { id: b });
        assert!(events.try_recv().is_err());
        assert_eq!(output.cancelled(), vec![a]);
    }

    #[tokio::test]
    async fn test_input_feeds_blocks_until_stream_drops() {
        let input = SimInput::new(SampleRate::Hz16000);
        let mut stream = input.open(4096).unwrap();
        assert_eq!(input.opened_block_frames(), Some(4096));

        assert!(input.feed(vec![0.1; 4096]));
        let block = stream.blocks.recv().await.unwrap();
        assert_eq!(block.len(), 4096);
        assert!(!input.stopped());

        drop(stream);
        assert!(input.stopped());
    }
}
