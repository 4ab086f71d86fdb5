//! Streaming-socket transport.
//!
//! # API Reference
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Headers: `Authorization: Bearer <credential>`, `OpenAI-Beta: realtime=v1`
//! - Audio: PCM16 base64-framed inside `input_audio_buffer.append` /
//!   `response.audio.delta` events
//!
//! The connection is considered established once the service sends
//! `session.created`. There is no internal reconnect: a lost socket is
//! reported as a state change and recovery belongs to the owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::credentials::Credential;
use crate::core::realtime::{ClientEvent, OPENAI_BETA_HEADER, ServerEvent};
use crate::core::transport::base::{
    Transport, TransportError, TransportEvent, TransportEventHub, TransportOptions,
    TransportResult, TransportState, TransportType,
};

/// Channel capacity for outbound socket frames.
const WS_CHANNEL_CAPACITY: usize = 256;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// =============================================================================
// Stream Transport
// =============================================================================

/// WebSocket transport to the realtime service.
///
/// Outbound events go through an mpsc channel drained by the connection task;
/// inbound frames are decoded by the same task and published on the
/// transport's event hub.
pub struct StreamTransport {
    options: TransportOptions,
    hub: Arc<TransportEventHub>,
    ws_sender: Mutex<Option<mpsc::Sender<ClientEvent>>>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
    /// Set before a deliberate close so the task reports `disconnected`
    /// rather than a loss.
    intentional_close: Arc<AtomicBool>,
    capturing: AtomicBool,
}

impl StreamTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            hub: Arc::new(TransportEventHub::new()),
            ws_sender: Mutex::new(None),
            connection_handle: Mutex::new(None),
            cancel: Mutex::new(None),
            intentional_close: Arc::new(AtomicBool::new(false)),
            capturing: AtomicBool::new(false),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn build_request(
        &self,
        credential: &Credential,
    ) -> TransportResult<http::Request<()>> {
        let url = self.options.endpoints.stream_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::connect(TransportType::Stream, e))?;

        let bearer = credential.bearer();
        let auth = HeaderValue::from_str(bearer.as_str())
            .map_err(|e| TransportError::connect(TransportType::Stream, e))?;
        let headers = request.headers_mut();
        headers.insert(http::header::AUTHORIZATION, auth);
        headers.insert(
            OPENAI_BETA_HEADER.0,
            HeaderValue::from_static(OPENAI_BETA_HEADER.1),
        );
        Ok(request)
    }

    /// Read frames until `session.created`, bounded by `deadline`.
    async fn await_session_created(
        ws: &mut WsStream,
        hub: &TransportEventHub,
        deadline: Instant,
    ) -> TransportResult<()> {
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| TransportError::Handshake("timed out waiting for session.created".to_string()))?;

            match frame {
                Some(Ok(Message::Text(text))) => match ServerEvent::parse(&text) {
                    Ok(event @ ServerEvent::SessionCreated { .. }) => {
                        hub.publish(TransportEvent::Message(event));
                        return Ok(());
                    }
                    Ok(ServerEvent::Error { error }) => {
                        return Err(TransportError::Handshake(error.to_string()));
                    }
                    Ok(other) => {
                        debug!("Ignoring {} before session.created", other.event_type());
                    }
                    Err(e) => debug!("Unparseable frame during handshake: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    ws.send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::Handshake(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Handshake(
                        "socket closed before session.created".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            }
        }
    }

    async fn run_connection(
        ws: WsStream,
        mut rx: mpsc::Receiver<ClientEvent>,
        hub: Arc<TransportEventHub>,
        cancel: CancellationToken,
        intentional_close: Arc<AtomicBool>,
    ) {
        let (mut ws_sink, mut ws_stream) = ws.split();
        let mut final_state = TransportState::Disconnected;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }

                Some(event) = rx.recv() => {
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                        error!("Failed to send WebSocket message: {}", e);
                        final_state = TransportState::Error;
                        break;
                    }
                }

                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => hub.publish_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("WebSocket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            final_state = TransportState::Error;
                            break;
                        }
                    }
                }
            }
        }

        if intentional_close.load(Ordering::SeqCst) {
            final_state = TransportState::Disconnected;
        }
        hub.set_state(final_state);
        debug!("Stream connection task finished ({})", final_state);
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stream
    }

    async fn connect(&self, credential: &Credential) -> TransportResult<()> {
        if self.hub.state() == TransportState::Connected {
            return Ok(());
        }

        self.intentional_close.store(false, Ordering::SeqCst);
        self.hub.set_state(TransportState::Connecting);

        let deadline = Instant::now() + self.options.handshake_timeout;
        let result: TransportResult<WsStream> = async {
            let request = self.build_request(credential)?;
            let (mut ws, _response) =
                tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| {
                        TransportError::connect(TransportType::Stream, "handshake timed out")
                    })?
                    .map_err(|e| TransportError::connect(TransportType::Stream, e))?;
            Self::await_session_created(&mut ws, &self.hub, deadline).await?;
            Ok(ws)
        }
        .await;

        let ws = match result {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Stream transport connect failed: {}", e);
                self.hub.set_state(TransportState::Failed);
                return Err(e);
            }
        };

        info!("Connected to realtime service over stream transport");

        let (tx, rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        *self.ws_sender.lock() = Some(tx);
        *self.cancel.lock() = Some(cancel.clone());

        self.hub.set_state(TransportState::Connected);
        let handle = tokio::spawn(Self::run_connection(
            ws,
            rx,
            self.hub.clone(),
            cancel,
            self.intentional_close.clone(),
        ));
        *self.connection_handle.lock() = Some(handle);
        Ok(())
    }

    async fn send_message(&self, event: ClientEvent) -> TransportResult<()> {
        let sender = self.ws_sender.lock().clone();
        match sender {
            Some(sender) if self.hub.state() == TransportState::Connected => sender
                .send(event)
                .await
                .map_err(|_| TransportError::Closed),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn send_audio(&self, pcm: Bytes) -> TransportResult<()> {
        self.send_message(ClientEvent::audio_append(&pcm)).await
    }

    async fn commit_turn(&self) -> TransportResult<()> {
        self.send_message(ClientEvent::InputAudioBufferCommit).await
    }

    async fn start_capture(&self) -> TransportResult<()> {
        if self.hub.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capture(&self) -> TransportResult<()> {
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.intentional_close.store(true, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
        self.ws_sender.lock().take();

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let handle = self.connection_handle.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(self.options.close_timeout, handle).await.is_err() {
                warn!("Stream connection task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.hub.set_state(TransportState::Disconnected);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.hub.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.hub.subscribe()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::RealtimeEndpoints;
    use time::OffsetDateTime;

    fn credential() -> Credential {
        Credential::new(
            "tok",
            "ephemeral",
            OffsetDateTime::now_utc() + time::Duration::minutes(5),
        )
    }

    #[test]
    fn test_request_carries_auth_headers() {
        let transport = StreamTransport::new(TransportOptions {
            endpoints: RealtimeEndpoints {
                ws_url: "ws://127.0.0.1:9/v1/realtime".to_string(),
                model: "m".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        let request = transport.build_request(&credential()).unwrap();
        assert_eq!(request.uri().to_string(), "ws://127.0.0.1:9/v1/realtime?model=m");
        assert_eq!(request.headers()["authorization"], "Bearer tok");
        assert_eq!(request.headers()["openai-beta"], "realtime=v1");
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = StreamTransport::new(TransportOptions::default());
        assert!(matches!(
            transport.send_audio(Bytes::from_static(&[0, 0])).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.commit_turn().await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.start_capture().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = StreamTransport::new(TransportOptions::default());
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }
}
