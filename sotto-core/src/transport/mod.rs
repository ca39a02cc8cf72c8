//! Streaming recognizer transport.
//!
//! The coordinator sees two object-safe seams: [`TransportFactory`] opens a
//! connection for a session, [`TransportLink`] sends audio and closes. The
//! real implementation speaks the binary protocol of [`frame`] over a
//! WebSocket; incoming frames are decoded on a reader task that posts
//! results and faults straight to the coordinator queue, stamped with the
//! session the connection was opened for.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::coordinator::EventSender;
use crate::error::{Result, SottoError};
use crate::machine::{Event, EventKind};
use crate::session::SessionToken;

pub use frame::AsrResult;

/// Connect budget, handshake included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An open recognizer connection.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Send one PCM block; `is_last` marks the flush sentinel. Failures are
    /// returned to the caller, which reports them as a transport fault.
    async fn send_audio(&self, pcm: &[u8], is_last: bool) -> Result<()>;
    /// Close the connection. Safe to call repeatedly.
    async fn close(&self);
}

/// Opens recognizer connections.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Connect on behalf of `session`. Recognition results and mid-stream
    /// faults are posted through `events`, stamped with `session`.
    async fn connect(
        &self,
        session: SessionToken,
        events: EventSender,
    ) -> Result<Arc<dyn TransportLink>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket transport for the streaming recognizer.
pub struct AsrTransport {
    cfg: TransportConfig,
    sample_rate: u32,
}

impl AsrTransport {
    pub fn new(cfg: TransportConfig, sample_rate: u32) -> Self {
        Self { cfg, sample_rate }
    }

    fn client_request(&self) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        let mut request = self
            .cfg
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SottoError::Transport(format!("bad endpoint: {e}")))?;

        let connect_id = Uuid::new_v4().to_string();
        let headers = request.headers_mut();
        headers.insert("X-Api-App-Key", header_value(&self.cfg.app_key)?);
        headers.insert("X-Api-Access-Key", header_value(&self.cfg.access_key)?);
        headers.insert("X-Api-Resource-Id", header_value(&self.cfg.resource_id)?);
        headers.insert("X-Api-Connect-Id", header_value(&connect_id)?);
        Ok(request)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SottoError::Transport("credential is not a valid header value".into()))
}

#[async_trait]
impl TransportFactory for AsrTransport {
    async fn connect(
        &self,
        session: SessionToken,
        events: EventSender,
    ) -> Result<Arc<dyn TransportLink>> {
        let request = self.client_request()?;

        let (ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| SottoError::ConnectTimeout)?
        .map_err(|e| SottoError::Transport(e.to_string()))?;

        let (mut sink, source) = ws.split();

        // The handshake must be the first frame on the wire.
        let handshake = frame::handshake_frame(&self.cfg, self.sample_rate)?;
        sink.send(Message::Binary(handshake))
            .await
            .map_err(|e| SottoError::Transport(format!("handshake send: {e}")))?;

        tokio::spawn(read_loop(source, session, events));

        info!(session = %session, "transport connected");
        Ok(Arc::new(AsrLink {
            sink: Mutex::new(Some(sink)),
        }))
    }
}

struct AsrLink {
    /// `None` after close. A tokio mutex: sends await the socket.
    sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl TransportLink for AsrLink {
    async fn send_audio(&self, pcm: &[u8], is_last: bool) -> Result<()> {
        let framed = frame::audio_frame(pcm, is_last)?;
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(SottoError::Transport("connection already closed".into()));
        };
        sink.send(Message::Binary(framed))
            .await
            .map_err(|e| SottoError::Transport(e.to_string()))
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("transport closed");
        }
    }
}

/// Decode incoming frames until the stream ends. Every outcome is delivered
/// to the coordinator queue; this task owns no state of its own.
async fn read_loop(mut source: WsSource, session: SessionToken, events: EventSender) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Binary(data)) => match frame::parse_server_frame(&data) {
                Ok(frame::ServerFrame::Result(result)) => {
                    events.post_asr(session, result);
                }
                Ok(frame::ServerFrame::Ack) => {
                    debug!(session = %session, "handshake acknowledged");
                }
                Ok(frame::ServerFrame::Error { code, message }) => {
                    warn!(session = %session, code, message = %message, "recognizer error");
                    events.post(
                        Event::for_session(EventKind::TransportError, session)
                            .with_detail(format!("recognizer error {code}: {message}")),
                    );
                }
                Err(e) => {
                    warn!(session = %session, error = %e, "undecodable server frame");
                    events.post(
                        Event::for_session(EventKind::TransportError, session)
                            .with_detail(e.to_string()),
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong/text: nothing to do
            Err(e) => {
                events.post(
                    Event::for_session(EventKind::TransportError, session)
                        .with_detail(e.to_string()),
                );
                break;
            }
        }
    }
    events.post(Event::for_session(EventKind::TransportDisconnected, session));
    debug!(session = %session, "transport reader exited");
}
