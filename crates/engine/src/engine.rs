//! Session orchestration
//!
//! One engine drives at most one live session at a time. `connect()` walks
//! the lifecycle in order: prepare devices, claim the ownership token, run
//! the transport handshake, then start the capture and playback pipelines
//! and the inbound event loop. Teardown is guarded by an atomic swap so the
//! cleanup sequence runs exactly once no matter which of the caller, the
//! backend or an evicting session triggers it.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use voice_session_audio::{
    AudioError, CaptureConfig, CaptureEncoder, CaptureStats, CaptureStream, DeviceArbiter,
    DeviceState, InputDevice, OutputDevice, OwnerId, PlaybackScheduler, PlaybackStats,
    RecordingOutput,
};
use voice_session_config::Settings;
use voice_session_core::{
    AudioFrame, Channels, CloseInfo, InboundEvent, MediaBlob, SampleRate, ToolCallResponse,
};
use voice_session_tools::{DispatchStats, ToolDispatcher, ToolRegistry};
use voice_session_transport::{SessionSetup, StreamHandle, StreamTransport, TransportStats};

use crate::state::{ConnectOptions, SessionEvent, SessionState, VolumeCallback};
use crate::EngineError;

const EVENT_CAPACITY: usize = 256;
const MEDIA_QUEUE_BLOCKS: usize = 32;
const TOOL_RESPONSE_QUEUE: usize = 16;

/// Counters gathered from every subsystem of the live session
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub playback: PlaybackStats,
    pub capture: CaptureStats,
    pub dispatch: DispatchStats,
    pub transport: TransportStats,
}

/// Devices prepared ahead of the handshake
struct WarmDevices {
    stream: CaptureStream,
    output: Arc<dyn OutputDevice>,
}

/// Why a session is being torn down
#[derive(Debug)]
enum TeardownCause {
    /// Caller asked, or a caller-initiated cancel won the race
    Disconnect,
    /// Backend sent a closed message
    Remote(CloseInfo),
    /// Backend reported a channel-level error
    RemoteError(String),
    /// Playback or capture hardware failed mid-session
    DeviceFailure(String),
    /// Another session claimed the audio devices
    Evicted,
}

/// Everything owned by one live session
struct ActiveSession {
    owner: OwnerId,
    arbiter: Arc<DeviceArbiter>,
    scheduler: Arc<PlaybackScheduler>,
    encoder: CaptureEncoder,
    dispatcher: ToolDispatcher,
    handle: Arc<dyn StreamHandle>,
    playback_rate: SampleRate,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ActiveSession {
    /// Run the cleanup sequence once; later callers get `None`.
    ///
    /// Hardware is silenced synchronously so an evicting claimant owns
    /// quiet devices the moment this returns. The transport goodbye is
    /// network I/O and finishes on the returned task.
    fn teardown(&self, cause: TeardownCause) -> Option<JoinHandle<()>> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }
        tracing::info!(owner = %self.owner, cause = ?cause, "tearing down session");
        *self.state.write() = SessionState::Closing;

        self.encoder.stop();
        self.dispatcher.abort_all();
        self.scheduler.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.arbiter.release(self.owner);

        let (terminal, info) = match cause {
            TeardownCause::Disconnect => (
                SessionState::Closed,
                CloseInfo::new("disconnected by caller", None),
            ),
            TeardownCause::Remote(info) => (SessionState::Closed, info),
            TeardownCause::RemoteError(message) => (
                SessionState::Failed,
                CloseInfo::new(format!("backend error: {message}"), None),
            ),
            TeardownCause::DeviceFailure(message) => {
                (SessionState::Failed, CloseInfo::new(message, None))
            },
            TeardownCause::Evicted => (
                SessionState::Closed,
                CloseInfo::new("evicted by another session", None),
            ),
        };
        *self.state.write() = terminal;
        let _ = self.events.send(SessionEvent::Closed(info));

        let handle = Arc::clone(&self.handle);
        Some(tokio::spawn(async move {
            if let Err(err) = handle.close().await {
                tracing::debug!(error = %err, "transport close after teardown failed");
            }
        }))
    }
}

/// Client-side engine for one duplex voice session
///
/// Construct with the devices and transport to use, register tools, then
/// `connect()`. Progress is observable through [`subscribe`] events; all
/// methods are safe to call from any task.
///
/// [`subscribe`]: VoiceSessionEngine::subscribe
pub struct VoiceSessionEngine {
    settings: Settings,
    transport: Arc<dyn StreamTransport>,
    input: Arc<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    arbiter: Arc<DeviceArbiter>,
    tools: Arc<ToolRegistry>,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    warmed: Mutex<Option<WarmDevices>>,
    active: Arc<Mutex<Option<Arc<ActiveSession>>>>,
    /// Bumped by `disconnect()` to cancel a connect still in flight
    epoch: AtomicU64,
}

impl VoiceSessionEngine {
    pub fn new(
        settings: Settings,
        transport: Arc<dyn StreamTransport>,
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            transport,
            input,
            output,
            arbiter: DeviceArbiter::global(),
            tools: Arc::new(ToolRegistry::new()),
            state: Arc::new(RwLock::new(SessionState::Idle)),
            events,
            warmed: Mutex::new(None),
            active: Arc::new(Mutex::new(None)),
            epoch: AtomicU64::new(0),
        }
    }

    /// Use an explicit arbiter instead of the process-wide one
    pub fn with_arbiter(mut self, arbiter: Arc<DeviceArbiter>) -> Self {
        self.arbiter = arbiter;
        self
    }

    /// Tools advertised to the backend and served by the dispatcher
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the live session's counters, zeroed when none is active
    pub fn stats(&self) -> EngineStats {
        let active = self.active.lock();
        match active.as_ref() {
            Some(session) => EngineStats {
                playback: session.scheduler.stats(),
                capture: session.encoder.stats(),
                dispatch: session.dispatcher.stats(),
                transport: session.handle.stats(),
            },
            None => EngineStats::default(),
        }
    }

    /// Prepare the audio devices ahead of `connect()`
    ///
    /// Optional warm-up: opens the capture stream and the playback output
    /// (with WAV recording when configured) so the handshake is the only
    /// remaining latency at connect time. No ownership token is claimed;
    /// a failure here leaves the arbiter untouched.
    pub fn initialize_audio(&self) -> Result<(), EngineError> {
        let state = self.state();
        if !matches!(
            state,
            SessionState::Idle | SessionState::Closed | SessionState::Failed
        ) {
            return Err(EngineError::AlreadyActive);
        }
        *self.state.write() = SessionState::Initializing;

        match self.prepare_devices() {
            Ok(warm) => {
                *self.warmed.lock() = Some(warm);
                Ok(())
            },
            Err(err) => {
                self.warmed.lock().take();
                *self.state.write() = SessionState::Failed;
                self.emit(SessionEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            },
        }
    }

    /// Open a full duplex session
    ///
    /// Runs `Initializing → Connecting → Active`. On success capture is
    /// streaming, response audio plays as it arrives and tool calls are
    /// dispatched. Any failure lands in a terminal state with all partial
    /// resources released; there is no automatic reconnect.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<(), EngineError> {
        if self.active.lock().is_some() {
            return Err(EngineError::AlreadyActive);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let wire_rate = self.capture_rate()?;
        let playback_rate = self.playback_rate()?;

        // Initializing: devices first, so a dead microphone never touches
        // the arbiter
        let warm = match self.warmed.lock().take() {
            Some(warm) => warm,
            None => {
                *self.state.write() = SessionState::Initializing;
                match self.prepare_devices() {
                    Ok(warm) => warm,
                    Err(err) => {
                        *self.state.write() = SessionState::Failed;
                        self.emit(SessionEvent::Error {
                            message: err.to_string(),
                        });
                        return Err(err);
                    },
                }
            },
        };
        let WarmDevices { stream, output } = warm;

        // Connecting: claim the token, then the handshake
        *self.state.write() = SessionState::Connecting;
        let owner = OwnerId::new_v4();
        let evict_slot = Arc::clone(&self.active);
        let _token = self.arbiter.claim(owner, move || {
            let taken = evict_slot.lock().take();
            if let Some(session) = taken {
                session.teardown(TeardownCause::Evicted);
            }
        });

        let setup = SessionSetup {
            voice_id: opts
                .voice_id
                .unwrap_or_else(|| self.settings.session.voice_id.clone()),
            system_instruction: opts.system_instruction.or_else(|| {
                let configured = self.settings.session.system_instruction.clone();
                (!configured.is_empty()).then_some(configured)
            }),
            tools: self.tools.declarations(),
            input_rate: wire_rate.as_u32(),
            output_rate: playback_rate.as_u32(),
        };

        let (handle, inbound) = match self.transport.connect(setup).await {
            Ok(pair) => pair,
            Err(err) => {
                self.arbiter.release(owner);
                *self.state.write() = SessionState::Failed;
                self.emit(SessionEvent::Error {
                    message: err.to_string(),
                });
                return Err(err.into());
            },
        };
        let handle: Arc<dyn StreamHandle> = Arc::from(handle);

        // Active: wire the pipelines
        let playing = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(PlaybackScheduler::with_grace(
            Arc::clone(&output),
            Arc::clone(&playing),
            Duration::from_millis(self.settings.audio.idle_grace_ms),
        ));
        scheduler.start();

        let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE_BLOCKS);
        let (response_tx, response_rx) = mpsc::channel(TOOL_RESPONSE_QUEUE);
        let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools), response_tx);

        let events = self.events.clone();
        let extra = opts.on_volume.clone();
        let on_volume: VolumeCallback = Arc::new(move |level| {
            if let Some(callback) = &extra {
                callback(level);
            }
            let _ = events.send(SessionEvent::InputLevel(level));
        });

        let encoder = CaptureEncoder::new(
            CaptureConfig {
                wire_rate,
                gain: self.settings.audio.capture_gain,
            },
            Arc::clone(&playing),
            media_tx,
            on_volume,
        );

        let session = Arc::new(ActiveSession {
            owner,
            arbiter: Arc::clone(&self.arbiter),
            scheduler,
            encoder,
            dispatcher,
            handle: Arc::clone(&handle),
            playback_rate,
            tasks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        });

        session.encoder.start(stream);
        let event_task = tokio::spawn(run_event_loop(Arc::clone(&session), inbound));
        let media_task = tokio::spawn(forward_media(Arc::clone(&handle), media_rx));
        let response_task = tokio::spawn(forward_tool_responses(Arc::clone(&handle), response_rx));
        session
            .tasks
            .lock()
            .extend([event_task, media_task, response_task]);

        // Install, unless a disconnect or a rival session beat us here
        {
            let mut slot = self.active.lock();
            if slot.is_some() {
                drop(slot);
                session.teardown(TeardownCause::Disconnect);
                return Err(EngineError::AlreadyActive);
            }
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(slot);
                session.teardown(TeardownCause::Disconnect);
                return Err(EngineError::Cancelled);
            }
            *slot = Some(Arc::clone(&session));
        }
        if self.arbiter.current_owner() != Some(owner) {
            if let Some(session) = self.active.lock().take() {
                session.teardown(TeardownCause::Evicted);
            }
            return Err(EngineError::Evicted);
        }

        *self.state.write() = SessionState::Active;
        self.emit(SessionEvent::Open);
        tracing::info!(owner = %owner, "session active");
        Ok(())
    }

    /// Reply to a tool call on behalf of the caller
    ///
    /// The dispatcher answers registered tools on its own; this path is for
    /// calls the caller handles outside the registry.
    pub async fn send_tool_response(&self, response: ToolCallResponse) -> Result<(), EngineError> {
        let handle = self
            .active
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.handle));
        match handle {
            Some(handle) => {
                handle.send_tool_response(response).await?;
                Ok(())
            },
            None => Err(EngineError::NotConnected),
        }
    }

    /// End the session and release every resource. Idempotent.
    pub async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.warmed.lock().take();

        let session = self.active.lock().take();
        match session {
            Some(session) => {
                if let Some(close) = session.teardown(TeardownCause::Disconnect) {
                    let _ = close.await;
                }
            },
            None => {
                let mut state = self.state.write();
                if matches!(
                    *state,
                    SessionState::Initializing | SessionState::Connecting
                ) {
                    *state = SessionState::Idle;
                }
            },
        }
    }

    fn prepare_devices(&self) -> Result<WarmDevices, EngineError> {
        if self.output.state() == DeviceState::Closed {
            return Err(AudioError::Closed.into());
        }
        let output: Arc<dyn OutputDevice> = match &self.settings.audio.record_path {
            Some(path) => Arc::new(RecordingOutput::create(
                Arc::clone(&self.output),
                path,
                self.playback_rate()?,
            )?),
            None => Arc::clone(&self.output),
        };
        let stream = self.input.open(self.settings.audio.block_frames)?;
        Ok(WarmDevices { stream, output })
    }

    fn capture_rate(&self) -> Result<SampleRate, EngineError> {
        SampleRate::from_u32(self.settings.audio.capture_rate)
            .ok_or(EngineError::UnsupportedRate(self.settings.audio.capture_rate))
    }

    fn playback_rate(&self) -> Result<SampleRate, EngineError> {
        SampleRate::from_u32(self.settings.audio.playback_rate)
            .ok_or(EngineError::UnsupportedRate(self.settings.audio.playback_rate))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Consume inbound events in delivery order until a terminal one arrives
///
/// Nothing here blocks: enqueue and interrupt are synchronous, tool calls
/// are handed off to the dispatcher.
async fn run_event_loop(session: Arc<ActiveSession>, mut inbound: mpsc::Receiver<InboundEvent>) {
    let mut sequence: u64 = 0;
    while let Some(event) = inbound.recv().await {
        match event {
            InboundEvent::Audio(bytes) => {
                let frame =
                    AudioFrame::from_pcm16(&bytes, session.playback_rate, Channels::Mono, sequence);
                sequence += 1;
                if frame.samples.is_empty() {
                    tracing::warn!("dropping empty audio chunk");
                    continue;
                }
                match session.scheduler.enqueue(frame) {
                    Ok(id) => tracing::trace!(buffer = %id, "response audio scheduled"),
                    Err(err) => {
                        tracing::error!(error = %err, "playback device failed");
                        let _ = session.events.send(SessionEvent::Error {
                            message: err.to_string(),
                        });
                        session.teardown(TeardownCause::DeviceFailure(err.to_string()));
                        return;
                    },
                }
            },
            InboundEvent::Transcript(segment) => {
                tracing::debug!(
                    is_final = segment.is_final,
                    speaker = ?segment.speaker,
                    "transcript: {}",
                    segment.text
                );
                let _ = session.events.send(SessionEvent::Transcript(segment));
            },
            InboundEvent::ToolCall(request) => {
                tracing::info!(id = %request.id, tool = %request.name, "tool call received");
                let _ = session.events.send(SessionEvent::ToolCallStarted {
                    id: request.id.clone(),
                    name: request.name.clone(),
                });
                session.dispatcher.dispatch(request);
            },
            InboundEvent::Interrupted => {
                tracing::info!("barge-in, cancelling response audio");
                session.scheduler.interrupt();
                let _ = session.events.send(SessionEvent::Interrupted);
            },
            InboundEvent::Closed(info) => {
                tracing::info!(reason = %info.reason, code = ?info.code, "backend closed the session");
                session.teardown(TeardownCause::Remote(info));
                return;
            },
            InboundEvent::Error { message } => {
                tracing::error!(error = %message, "backend reported an error");
                let _ = session.events.send(SessionEvent::Error {
                    message: message.clone(),
                });
                session.teardown(TeardownCause::RemoteError(message));
                return;
            },
        }
    }
    // Receiver ended without a terminal event; treat it as a remote close
    session.teardown(TeardownCause::Remote(CloseInfo::new(
        "transport channel closed",
        None,
    )));
}

async fn forward_media(handle: Arc<dyn StreamHandle>, mut media: mpsc::Receiver<MediaBlob>) {
    while let Some(blob) = media.recv().await {
        if let Err(err) = handle.send_media(blob).await {
            tracing::warn!(error = %err, "media send failed, stopping capture forwarding");
            break;
        }
    }
}

async fn forward_tool_responses(
    handle: Arc<dyn StreamHandle>,
    mut responses: mpsc::Receiver<ToolCallResponse>,
) {
    while let Some(response) = responses.recv().await {
        tracing::debug!(id = %response.id, tool = %response.name, "sending tool response");
        if let Err(err) = handle.send_tool_response(response).await {
            tracing::warn!(error = %err, "tool response send failed");
            break;
        }
    }
}
