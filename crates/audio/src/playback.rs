//! Gapless playback scheduling
//!
//! Buffers arrive from the network in bursts; each is scheduled to start
//! exactly when the previous one ends on the output clock. All clock reads
//! and writes go through this module; nothing else touches the schedule.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use voice_session_config::constants::playback::IDLE_GRACE_MS;
use voice_session_core::AudioFrame;

use crate::device::{BufferId, DeviceState, OutputDevice, OutputEvent};
use crate::error::AudioError;

/// Playback health counters
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    /// Buffers handed to the device
    pub scheduled: u64,
    /// Buffers that played to their natural end
    pub completed: u64,
    /// Buffers cancelled by interruption
    pub interrupted: u64,
    /// Buffers that arrived after their gapless start time and were
    /// clamped to "now"
    pub underruns: u64,
}

struct SchedulerInner {
    next_start: Duration,
    pending: HashSet<BufferId>,
}

struct Shared {
    output: Arc<dyn OutputDevice>,
    inner: Mutex<SchedulerInner>,
    playing: Arc<AtomicBool>,
    stats: RwLock<PlaybackStats>,
    idle_grace: Duration,
    grace_task: Mutex<Option<JoinHandle<()>>>,
}

/// Schedules response audio back-to-back on the output device
///
/// `playing` is the shared `is_playing_response` flag: true from the first
/// enqueued buffer until the grace window after the last one completes (or
/// until interruption). The capture side reads it to suppress its volume
/// metric.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    completion_task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn OutputDevice>, playing: Arc<AtomicBool>) -> Self {
        Self::with_grace(output, playing, Duration::from_millis(IDLE_GRACE_MS))
    }

    pub fn with_grace(
        output: Arc<dyn OutputDevice>,
        playing: Arc<AtomicBool>,
        idle_grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                output,
                inner: Mutex::new(SchedulerInner {
                    next_start: Duration::ZERO,
                    pending: HashSet::new(),
                }),
                playing,
                stats: RwLock::new(PlaybackStats::default()),
                idle_grace,
                grace_task: Mutex::new(None),
            }),
            completion_task: Mutex::new(None),
        }
    }

    /// Spawn the completion consumer. Must run before buffers can retire.
    pub fn start(&self) {
        let mut events = self.shared.output.subscribe();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(OutputEvent::Completed { id }) => handle_completion(&shared, id),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "playback completion events lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.completion_task.lock() = Some(task);
    }

    /// Schedule a response buffer for gapless playback
    ///
    /// Late arrivals are clamped to the current clock; the schedule never
    /// moves backward in time.
    pub fn enqueue(&self, frame: AudioFrame) -> Result<BufferId, AudioError> {
        match self.shared.output.state() {
            DeviceState::Running => {},
            DeviceState::Suspended => {
                tracing::debug!("output device suspended, attempting resume");
                self.shared.output.resume()?;
            },
            DeviceState::Closed => return Err(AudioError::Closed),
        }

        let duration = frame.duration;
        let mid_response = self.shared.playing.load(Ordering::SeqCst);

        let (id, start, late) = {
            let mut inner = self.shared.inner.lock();
            let now = self.shared.output.clock();
            let late = inner.next_start < now;
            let start = if late { now } else { inner.next_start };

            let id = self.shared.output.schedule(frame, start)?;
            inner.pending.insert(id);
            inner.next_start = start + duration;
            (id, start, late)
        };

        self.shared.playing.store(true, Ordering::SeqCst);
        cancel_grace(&self.shared);

        {
            let mut stats = self.shared.stats.write();
            stats.scheduled += 1;
            if late && mid_response {
                stats.underruns += 1;
            }
        }
        if late && mid_response {
            tracing::debug!(id, start_ms = start.as_millis() as u64, "late buffer clamped to now");
        }
        tracing::trace!(
            id,
            start_ms = start.as_millis() as u64,
            duration_ms = duration.as_millis() as u64,
            "buffer scheduled"
        );

        Ok(id)
    }

    /// Hard-stop everything queued or playing
    ///
    /// Idempotent; safe with an empty pending set.
    pub fn interrupt(&self) {
        let cancelled: Vec<BufferId> = {
            let mut inner = self.shared.inner.lock();
            let ids = inner.pending.drain().collect();
            inner.next_start = self.shared.output.clock();
            ids
        };

        for id in &cancelled {
            self.shared.output.cancel(*id);
        }
        self.shared.playing.store(false, Ordering::SeqCst);
        cancel_grace(&self.shared);

        if cancelled.is_empty() {
            tracing::debug!("interrupt with no pending audio");
        } else {
            self.shared.stats.write().interrupted += cancelled.len() as u64;
            tracing::info!(cancelled = cancelled.len(), "playback interrupted");
        }
    }

    /// Whether a response is currently playing (or inside the grace window)
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    /// Number of buffers scheduled but not yet completed or cancelled
    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Snapshot of the health counters
    pub fn stats(&self) -> PlaybackStats {
        self.shared.stats.read().clone()
    }

    /// Interrupt and tear the scheduler's tasks down. Idempotent.
    pub fn stop(&self) {
        self.interrupt();
        if let Some(task) = self.completion_task.lock().take() {
            task.abort();
        }
    }
}

fn handle_completion(shared: &Arc<Shared>, id: BufferId) {
    let became_empty = {
        let mut inner = shared.inner.lock();
        if !inner.pending.remove(&id) {
            // Cancelled before its completion event was consumed
            return;
        }
        inner.pending.is_empty()
    };

    shared.stats.write().completed += 1;
    tracing::trace!(id, became_empty, "buffer completed");

    if became_empty {
        arm_grace(shared);
    }
}

/// Start the idle-grace countdown; a new enqueue aborts it
fn arm_grace(shared: &Arc<Shared>) {
    let mut slot = shared.grace_task.lock();
    if let Some(task) = slot.take() {
        task.abort();
    }

    let this = Arc::clone(shared);
    *slot = Some(tokio::spawn(async move {
        tokio::time::sleep(this.idle_grace).await;
        // Re-check under the lock: a buffer may have arrived while the
        // abort was in flight.
        let still_empty = this.inner.lock().pending.is_empty();
        if still_empty {
            this.playing.store(false, Ordering::SeqCst);
            tracing::debug!("response playback finished");
        }
    }));
}

fn cancel_grace(shared: &Shared) {
    if let Some(task) = shared.grace_task.lock().take() {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimOutput;
    use voice_session_core::{Channels, SampleRate};

    fn frame_ms(ms: u64) -> AudioFrame {
        let samples = vec![0.0f32; SampleRate::Hz24000.samples_per_ms() * ms as usize];
        AudioFrame::new(samples, SampleRate::Hz24000, Channels::Mono, 0)
    }

    fn scheduler_with(output: &Arc<SimOutput>) -> PlaybackScheduler {
        let playing = Arc::new(AtomicBool::new(false));
        PlaybackScheduler::new(Arc::clone(output) as Arc<dyn OutputDevice>, playing)
    }

    #[tokio::test]
    async fn test_gapless_sequential_starts() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        scheduler.enqueue(frame_ms(100)).unwrap();
        scheduler.enqueue(frame_ms(250)).unwrap();
        scheduler.enqueue(frame_ms(40)).unwrap();

        let log = output.schedule_log();
        assert_eq!(log[0].start, Duration::ZERO);
        assert_eq!(log[1].start, Duration::from_millis(100));
        assert_eq!(log[2].start, Duration::from_millis(350));
        assert_eq!(scheduler.pending_count(), 3);
        assert!(scheduler.is_playing());
    }

    #[tokio::test]
    async fn test_late_arrival_clamps_to_now() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        scheduler.enqueue(frame_ms(100)).unwrap();
        // Playback ran past the end of the first buffer with nothing queued
        output.advance(Duration::from_millis(250));

        scheduler.enqueue(frame_ms(100)).unwrap();

        let log = output.schedule_log();
        assert_eq!(log[1].start, Duration::from_millis(250));
        assert_eq!(scheduler.stats().underruns, 1);

        // Schedule stayed ahead of the clock
        scheduler.enqueue(frame_ms(100)).unwrap();
        assert_eq!(output.schedule_log()[2].start, Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_first_buffer_clamp_is_not_an_underrun() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        output.advance(Duration::from_secs(1));
        scheduler.enqueue(frame_ms(100)).unwrap();

        assert_eq!(output.schedule_log()[0].start, Duration::from_secs(1));
        assert_eq!(scheduler.stats().underruns, 0);
    }

    #[tokio::test]
    async fn test_interrupt_is_total_and_idempotent() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        for _ in 0..3 {
            scheduler.enqueue(frame_ms(100)).unwrap();
        }

        scheduler.interrupt();
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.is_playing());
        assert_eq!(output.cancelled().len(), 3);
        assert_eq!(scheduler.stats().interrupted, 3);

        // Safe with nothing pending
        scheduler.interrupt();
        assert_eq!(output.cancelled().len(), 3);

        // Next buffer starts fresh at the clock
        scheduler.enqueue(frame_ms(100)).unwrap();
        assert_eq!(output.schedule_log()[3].start, output.clock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_marks_idle() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);
        scheduler.start();

        scheduler.enqueue(frame_ms(100)).unwrap();
        output.advance(Duration::from_millis(150));

        // Let the completion task arm the grace timer
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(scheduler.pending_count(), 0);
        assert!(scheduler.is_playing(), "still inside the grace window");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!scheduler.is_playing());
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_buffer_within_grace_keeps_playing() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);
        scheduler.start();

        scheduler.enqueue(frame_ms(100)).unwrap();
        output.advance(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_playing());

        // Burst resumes before the grace window expires
        scheduler.enqueue(frame_ms(100)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(scheduler.is_playing());
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_suspended_device_resumes_once() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        output.set_state(DeviceState::Suspended);
        scheduler.enqueue(frame_ms(100)).unwrap();
        assert_eq!(output.resume_calls(), 1);
        assert_eq!(output.schedule_log().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_resume_surfaces_device_error() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        output.set_state(DeviceState::Suspended);
        output.set_resume_fails(true);

        let err = scheduler.enqueue(frame_ms(100)).unwrap_err();
        assert!(matches!(err, AudioError::Device(_)));
        assert!(output.schedule_log().is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_device_rejects_enqueue() {
        let output = SimOutput::new();
        let scheduler = scheduler_with(&output);

        output.set_state(DeviceState::Closed);
        let err = scheduler.enqueue(frame_ms(100)).unwrap_err();
        assert!(matches!(err, AudioError::Closed));
    }
}
