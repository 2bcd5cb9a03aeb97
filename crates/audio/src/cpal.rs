//! Hardware devices via cpal
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it for its whole life. The async side talks to the playback
//! thread over a command channel; the capture thread just watches a stop
//! flag. Everything the mixer callback touches is lock-light: one short
//! critical section per callback on the buffer timeline.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use voice_session_config::constants::audio::MAX_BLOCK_BACKLOG;
use voice_session_core::{AudioFrame, BlockAssembler, Channels, SampleRate};

use crate::device::{
    BufferId, CaptureStream, DeviceState, InputDevice, OutputDevice, OutputEvent,
};
use crate::error::AudioError;

const BLOCK_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const THREAD_START_TIMEOUT: Duration = Duration::from_secs(5);
const RESUME_TIMEOUT: Duration = Duration::from_secs(1);

const STATE_RUNNING: u8 = 0;
const STATE_SUSPENDED: u8 = 1;
const STATE_CLOSED: u8 = 2;

fn state_from_u8(raw: u8) -> DeviceState {
    match raw {
        STATE_RUNNING => DeviceState::Running,
        STATE_SUSPENDED => DeviceState::Suspended,
        _ => DeviceState::Closed,
    }
}

/// Default-host microphone input
#[derive(Debug, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl InputDevice for CpalInput {
    fn open(&self, block_frames: usize) -> Result<CaptureStream, AudioError> {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let (block_tx, block_rx) = tokio::sync::mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let built = open_capture_stream(block_frames, block_tx);
                match built {
                    Ok((stream, rate)) => {
                        let _ = ack_tx.send(Ok(rate));
                        while !thread_stop.load(Ordering::Acquire) {
                            std::thread::park_timeout(Duration::from_millis(100));
                        }
                        drop(stream);
                        tracing::debug!("capture stream closed");
                    },
                    Err(err) => {
                        let _ = ack_tx.send(Err(err));
                    },
                }
            })
            .map_err(|err| AudioError::Device(format!("capture thread spawn failed: {err}")))?;

        match ack_rx.recv_timeout(THREAD_START_TIMEOUT) {
            Ok(Ok(rate)) => {
                tracing::info!(rate = rate.as_u32(), block_frames, "capture device opened");
                // The callback downmixes, so the stream is always mono
                Ok(CaptureStream::with_stop(rate, Channels::Mono, block_rx, stop))
            },
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AudioError::Device("capture thread did not start".into())),
        }
    }
}

fn open_capture_stream(
    block_frames: usize,
    block_tx: tokio::sync::mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, SampleRate), AudioError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoDevice)?;
    let supported = device.default_input_config()?;
    let rate = SampleRate::from_u32(supported.sample_rate().0)
        .ok_or(AudioError::UnsupportedRate(supported.sample_rate().0))?;
    let channels = supported.channels() as usize;
    let config = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_capture_stream::<f32>(&device, &config, channels, block_frames, block_tx)?
        },
        SampleFormat::I16 => {
            build_capture_stream::<i16>(&device, &config, channels, block_frames, block_tx)?
        },
        SampleFormat::U16 => {
            build_capture_stream::<u16>(&device, &config, channels, block_frames, block_tx)?
        },
        other => {
            return Err(AudioError::Device(format!(
                "unsupported capture sample format {other:?}"
            )))
        },
    };
    stream.play()?;
    Ok((stream, rate))
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    block_frames: usize,
    block_tx: tokio::sync::mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut assembler = BlockAssembler::new(block_frames, MAX_BLOCK_BACKLOG);
    let mut mono: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            if channels <= 1 {
                mono.extend(data.iter().map(|s| f32::from_sample(*s)));
            } else {
                mono.extend(data.chunks_exact(channels).map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32
                }));
            }
            assembler.push(&mono);
            while let Some(block) = assembler.next_block() {
                // A full consumer means we are behind; dropping the block
                // keeps capture latency bounded.
                if block_tx.try_send(block).is_err() {
                    tracing::trace!("capture block dropped, channel full");
                }
            }
        },
        |err| tracing::warn!(error = %err, "capture stream error"),
        None,
    )?;
    Ok(stream)
}

struct ScheduledBuffer {
    id: BufferId,
    start_frame: u64,
    samples: Arc<[f32]>,
    cursor: usize,
}

struct OutputShared {
    sample_rate: SampleRate,
    frames_played: AtomicU64,
    timeline: Mutex<Vec<ScheduledBuffer>>,
    events: broadcast::Sender<OutputEvent>,
    state: AtomicU8,
    next_id: AtomicU64,
}

enum OutputCommand {
    Resume {
        reply: std::sync::mpsc::Sender<Result<(), String>>,
    },
    Shutdown,
}

/// Default-host speaker output with a sample-accurate scheduling clock
///
/// The clock is the number of frames the device has consumed, which is the
/// only timebase the mixer callback and the scheduler can agree on.
pub struct CpalOutput {
    shared: Arc<OutputShared>,
    commands: std::sync::mpsc::Sender<OutputCommand>,
}

impl CpalOutput {
    pub fn new() -> Result<Self, AudioError> {
        let (command_tx, command_rx) = std::sync::mpsc::channel::<OutputCommand>();
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let built = open_playback_stream();
                match built {
                    Ok((stream, shared)) => {
                        let _ = ack_tx.send(Ok(Arc::clone(&shared)));
                        loop {
                            match command_rx.recv_timeout(Duration::from_millis(100)) {
                                Ok(OutputCommand::Resume { reply }) => {
                                    let result =
                                        stream.play().map_err(|err| err.to_string());
                                    let _ = reply.send(result);
                                },
                                Ok(OutputCommand::Shutdown) => break,
                                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {},
                            }
                        }
                        shared.state.store(STATE_CLOSED, Ordering::SeqCst);
                        drop(stream);
                        tracing::debug!("playback stream closed");
                    },
                    Err(err) => {
                        let _ = ack_tx.send(Err(err));
                    },
                }
            })
            .map_err(|err| AudioError::Device(format!("playback thread spawn failed: {err}")))?;

        match ack_rx.recv_timeout(THREAD_START_TIMEOUT) {
            Ok(Ok(shared)) => {
                tracing::info!(rate = shared.sample_rate.as_u32(), "playback device opened");
                Ok(Self { shared, commands: command_tx })
            },
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AudioError::Device("playback thread did not start".into())),
        }
    }
}

fn open_playback_stream() -> Result<(cpal::Stream, Arc<OutputShared>), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let supported = device.default_output_config()?;
    let rate = SampleRate::from_u32(supported.sample_rate().0)
        .ok_or(AudioError::UnsupportedRate(supported.sample_rate().0))?;
    let channels = supported.channels() as usize;
    let config = supported.config();

    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let shared = Arc::new(OutputShared {
        sample_rate: rate,
        frames_played: AtomicU64::new(0),
        timeline: Mutex::new(Vec::new()),
        events,
        state: AtomicU8::new(STATE_RUNNING),
        next_id: AtomicU64::new(0),
    });

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_playback_stream::<f32>(&device, &config, channels, &shared)?,
        SampleFormat::I16 => build_playback_stream::<i16>(&device, &config, channels, &shared)?,
        SampleFormat::U16 => build_playback_stream::<u16>(&device, &config, channels, &shared)?,
        other => {
            return Err(AudioError::Device(format!(
                "unsupported playback sample format {other:?}"
            )))
        },
    };
    stream.play()?;
    Ok((stream, shared))
}

fn build_playback_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    shared: &Arc<OutputShared>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mix_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            scratch.clear();
            scratch.resize(frames, 0.0);
            mix_frames(&mix_shared, &mut scratch);
            for (i, value) in scratch.iter().enumerate() {
                let sample = T::from_sample(value.clamp(-1.0, 1.0));
                for ch in 0..channels {
                    data[i * channels + ch] = sample;
                }
            }
        },
        move |err| {
            tracing::warn!(error = %err, "playback stream error, marking device suspended");
            err_shared.state.store(STATE_SUSPENDED, Ordering::SeqCst);
        },
        None,
    )?;
    Ok(stream)
}

/// Mix every scheduled buffer overlapping this callback into `scratch`
/// (mono frames) and retire the ones that finish.
fn mix_frames(shared: &OutputShared, scratch: &mut [f32]) {
    let base = shared.frames_played.load(Ordering::Acquire);
    let frames = scratch.len() as u64;

    let finished: Vec<BufferId> = {
        let mut timeline = shared.timeline.lock();
        for buffer in timeline.iter_mut() {
            // A buffer scheduled for a frame the clock already passed is
            // shifted to start at this callback, untrimmed.
            if buffer.cursor == 0 && buffer.start_frame < base {
                buffer.start_frame = base;
            }
            // Next global frame this buffer will play. For a partially
            // consumed buffer this lands exactly on `base`.
            let current = buffer.start_frame + buffer.cursor as u64;
            if current >= base + frames {
                continue;
            }
            let offset = current.saturating_sub(base) as usize;
            for slot in scratch[offset..].iter_mut() {
                match buffer.samples.get(buffer.cursor) {
                    Some(sample) => {
                        *slot += sample;
                        buffer.cursor += 1;
                    },
                    None => break,
                }
            }
        }

        let mut finished = Vec::new();
        timeline.retain(|buffer| {
            if buffer.cursor >= buffer.samples.len() {
                finished.push(buffer.id);
                false
            } else {
                true
            }
        });
        finished
    };

    shared.frames_played.fetch_add(frames, Ordering::Release);
    for id in finished {
        let _ = shared.events.send(OutputEvent::Completed { id });
    }
}

impl OutputDevice for CpalOutput {
    fn clock(&self) -> Duration {
        let frames = self.shared.frames_played.load(Ordering::Acquire);
        Duration::from_secs_f64(frames as f64 / self.shared.sample_rate.as_u32() as f64)
    }

    fn state(&self) -> DeviceState {
        state_from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn resume(&self) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.commands
            .send(OutputCommand::Resume { reply: reply_tx })
            .map_err(|_| AudioError::Closed)?;

        match reply_rx.recv_timeout(RESUME_TIMEOUT) {
            Ok(Ok(())) => {
                self.shared.state.store(STATE_RUNNING, Ordering::SeqCst);
                Ok(())
            },
            Ok(Err(message)) => Err(AudioError::Device(message)),
            Err(_) => Err(AudioError::Device("resume timed out".into())),
        }
    }

    fn schedule(&self, frame: AudioFrame, start: Duration) -> Result<BufferId, AudioError> {
        if self.state() == DeviceState::Closed {
            return Err(AudioError::Closed);
        }

        let mut frame = frame;
        if frame.channels == Channels::Stereo {
            frame = frame.to_mono();
        }
        if frame.sample_rate != self.shared.sample_rate {
            frame = frame.resample(self.shared.sample_rate);
        }

        let rate = self.shared.sample_rate.as_u32() as f64;
        let start_frame = (start.as_secs_f64() * rate).round() as u64;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.timeline.lock().push(ScheduledBuffer {
            id,
            start_frame,
            samples: Arc::clone(&frame.samples),
            cursor: 0,
        });
        Ok(id)
    }

    fn cancel(&self, id: BufferId) {
        self.shared.timeline.lock().retain(|buffer| buffer.id != id);
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(OutputCommand::Shutdown);
    }
}
