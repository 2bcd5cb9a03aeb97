//! WebSocket stream transport
//!
//! One connection per session. Connect dials the endpoint, sends the setup
//! message and waits for the backend's `ready` before handing the stream
//! over. A reader task then normalizes every inbound frame into an
//! [`InboundEvent`]; writes go through a shared sink guarded by an async
//! mutex so audio blocks and tool responses never interleave mid-frame.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use voice_session_config::constants::transport::{
    CONNECT_TIMEOUT_MS, DEFAULT_ENDPOINT, EVENT_CHANNEL_CAPACITY,
};
use voice_session_core::{CloseInfo, InboundEvent, MediaBlob, ToolCallResponse};

use crate::traits::{SessionSetup, StreamHandle, StreamTransport, TransportStats};
use crate::wire::{ClientMessage, ServerMessage};
use crate::TransportError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection settings for [`WsTransport`]
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// ws:// or wss:// endpoint
    pub endpoint: String,
    /// Bearer token sent in the Authorization header
    pub api_key: Option<String>,
    /// Covers dialing plus the setup/ready handshake
    pub connect_timeout: Duration,
    /// Inbound event channel capacity
    pub event_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// WebSocket implementation of [`StreamTransport`]
pub struct WsTransport {
    config: WsConfig,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(
        &self,
        setup: SessionSetup,
    ) -> Result<(Box<dyn StreamHandle>, mpsc::Receiver<InboundEvent>), TransportError> {
        let mut request = self.config.endpoint.as_str().into_client_request()?;
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                TransportError::ConnectionFailed("api key is not a valid header value".into())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let timeout_ms = self.config.connect_timeout.as_millis() as u64;
        let (stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(request))
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout_ms))??;

        let (sink, mut source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let stats = Arc::new(RwLock::new(TransportStats::default()));

        send_client(&sink, &ClientMessage::setup(setup)).await?;
        stats.write().sent_messages += 1;

        let session_id =
            tokio::time::timeout(self.config.connect_timeout, await_ready(&mut source))
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout_ms))??;
        tracing::info!(
            endpoint = %self.config.endpoint,
            session_id = ?session_id,
            "stream established"
        );

        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);
        let reader = tokio::spawn(read_loop(source, event_tx, Arc::clone(&stats)));

        let handle = WsStreamHandle {
            sink,
            stats,
            reader,
        };
        Ok((Box::new(handle), event_rx))
    }
}

async fn send_client(
    sink: &Arc<Mutex<WsSink>>,
    message: &ClientMessage,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(message)?;
    let mut sink = sink.lock().await;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Consume frames until the backend acknowledges the setup
async fn await_ready(source: &mut WsSource) -> Result<Option<String>, TransportError> {
    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => {
                let parsed: ServerMessage = serde_json::from_str(&text).map_err(|err| {
                    TransportError::Handshake(format!("unparseable handshake reply: {err}"))
                })?;
                return match parsed {
                    ServerMessage::Ready { session_id } => Ok(session_id),
                    ServerMessage::Error { message } => Err(TransportError::Handshake(message)),
                    other => Err(TransportError::Handshake(format!(
                        "expected ready, got {other:?}"
                    ))),
                };
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".into(),
                ))
            },
            other => {
                return Err(TransportError::Handshake(format!(
                    "unexpected frame during handshake: {other:?}"
                )))
            },
        }
    }
    Err(TransportError::Handshake(
        "connection ended during handshake".into(),
    ))
}

/// Normalize inbound frames until the stream ends or a terminal event fires
///
/// Unparseable messages and bad audio payloads are dropped one at a time;
/// only stream-level failures end the loop.
async fn read_loop(
    mut source: WsSource,
    event_tx: mpsc::Sender<InboundEvent>,
    stats: Arc<RwLock<TransportStats>>,
) {
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "stream read failed");
                let _ = event_tx
                    .send(InboundEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                break;
            },
        };

        match message {
            Message::Text(text) => {
                stats.write().received_messages += 1;
                let parsed: ServerMessage = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        stats.write().decode_failures += 1;
                        tracing::warn!(error = %err, "unparseable server message dropped");
                        continue;
                    },
                };
                match parsed.into_event() {
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    },
                    Ok(None) => {},
                    Err(err) => {
                        stats.write().decode_failures += 1;
                        tracing::warn!(error = %err, "bad audio payload dropped");
                    },
                }
            },
            Message::Binary(data) => {
                // Raw PCM16 frames, sent by backends that skip base64
                stats.write().received_messages += 1;
                if event_tx.send(InboundEvent::Audio(Bytes::from(data))).await.is_err() {
                    break;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {},
            Message::Close(frame) => {
                let info = frame
                    .map(|frame| {
                        CloseInfo::new(frame.reason.to_string(), Some(u16::from(frame.code)))
                    })
                    .unwrap_or_else(|| CloseInfo::new("connection closed", None));
                let _ = event_tx.send(InboundEvent::Closed(info)).await;
                break;
            },
            Message::Frame(_) => {},
        }
    }
    tracing::debug!("stream read loop ended");
}

struct WsStreamHandle {
    sink: Arc<Mutex<WsSink>>,
    stats: Arc<RwLock<TransportStats>>,
    reader: JoinHandle<()>,
}

impl WsStreamHandle {
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        send_client(&self.sink, message).await?;
        self.stats.write().sent_messages += 1;
        Ok(())
    }
}

#[async_trait]
impl StreamHandle for WsStreamHandle {
    async fn send_media(&self, blob: MediaBlob) -> Result<(), TransportError> {
        self.send(&ClientMessage::Audio { media: blob }).await
    }

    async fn send_tool_response(&self, response: ToolCallResponse) -> Result<(), TransportError> {
        self.send(&ClientMessage::from(response)).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Best effort; the backend may already be gone
        let _ = self.send(&ClientMessage::EndSession).await;

        let result = {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        self.reader.abort();

        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }
}

impl Drop for WsStreamHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
