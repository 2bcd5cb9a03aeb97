//! Voice session entry point
//!
//! Connects the microphone and speakers to a remote voice backend and runs
//! a full duplex conversation until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_session_audio::{CpalInput, CpalOutput, InputDevice, OutputDevice, SimInput, SimOutput};
use voice_session_config::{load_settings, AudioBackend, Settings};
use voice_session_core::SampleRate;
use voice_session_engine::{ConnectOptions, EngineError, SessionEvent, VoiceSessionEngine};
use voice_session_transport::{WsConfig, WsTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("VOICE_SESSION_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {}. Using defaults.", e);
            Settings::default()
        },
    };

    init_tracing(&settings);
    tracing::info!("Starting voice session v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?settings.environment,
        backend = ?settings.audio.backend,
        endpoint = %settings.transport.endpoint,
        "Configuration loaded"
    );

    let (input, output) = build_devices(&settings)?;
    let transport = Arc::new(WsTransport::new(WsConfig {
        endpoint: settings.transport.endpoint.clone(),
        api_key: settings.transport.api_key.clone(),
        connect_timeout: Duration::from_millis(settings.transport.connect_timeout_ms),
        event_capacity: settings.transport.event_capacity,
    }));

    let engine = VoiceSessionEngine::new(settings, transport, input, output);
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    engine.connect(ConnectOptions::default()).await?;
    shutdown_signal().await;

    engine.disconnect().await;
    tracing::info!("Session closed");
    Ok(())
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::Open => tracing::info!("Session open, speak when ready"),
        SessionEvent::Transcript(segment) => {
            tracing::info!(
                speaker = ?segment.speaker,
                is_final = segment.is_final,
                "{}",
                segment.text
            );
        },
        SessionEvent::InputLevel(level) => tracing::trace!(level, "input level"),
        SessionEvent::Interrupted => tracing::info!("Response interrupted"),
        SessionEvent::ToolCallStarted { id, name } => {
            tracing::info!(id = %id, tool = %name, "Tool call started");
        },
        SessionEvent::Closed(info) => {
            tracing::info!(reason = %info.reason, code = ?info.code, "Session closed");
        },
        SessionEvent::Error { message } => tracing::error!("Session error: {}", message),
    }
}

fn build_devices(
    settings: &Settings,
) -> Result<(Arc<dyn InputDevice>, Arc<dyn OutputDevice>), EngineError> {
    match settings.audio.backend {
        AudioBackend::Cpal => {
            let output = CpalOutput::new()?;
            Ok((Arc::new(CpalInput::new()), Arc::new(output)))
        },
        AudioBackend::Sim => {
            let capture_rate = SampleRate::from_u32(settings.audio.capture_rate)
                .ok_or(EngineError::UnsupportedRate(settings.audio.capture_rate))?;
            tracing::warn!("Simulated audio backend selected, no hardware will be used");
            Ok((SimInput::new(capture_rate), SimOutput::new()))
        },
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, closing session...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, closing session...");
        }
    }
}

/// Initialize tracing with env-filter and optional JSON output
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("voice_session={}", settings.observability.log_level).into());

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
