//! Peer-connection transport.
//!
//! # Negotiation
//!
//! 1. Build a peer connection with a G.711 u-law local audio track and the
//!    `oai-events` data channel
//! 2. Create the offer and wait for ICE gathering to complete
//! 3. `POST` the offer SDP (`Content-Type: application/sdp`) with the bearer
//!    credential; the response body is the answer SDP
//! 4. Apply the answer and wait for the data channel to open
//!
//! Steps 2-4 are bounded by the handshake timeout.
//!
//! # Audio
//!
//! The media track carries 8kHz u-law. Outbound PCM16 at 16kHz is downsampled
//! and companded in 20ms frames; inbound RTP payloads are expanded and
//! upsampled back to 16kHz PCM16.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::capture::AudioCapture;
use crate::core::audio::{self, BYTES_PER_SAMPLE, PEER_SAMPLE_RATE, SAMPLE_RATE};
use crate::core::credentials::Credential;
use crate::core::realtime::{ClientEvent, EVENTS_CHANNEL_LABEL};
use crate::core::transport::base::{
    AudioChunk, Transport, TransportError, TransportEvent, TransportEventHub, TransportOptions,
    TransportResult, TransportState, TransportType,
};

/// Static RTP payload type of PCMU.
const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Outbound frame length.
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Bytes of 16kHz PCM16 in one outbound frame.
const FRAME_BYTES: usize =
    (SAMPLE_RATE as usize / 1000) * FRAME_DURATION.as_millis() as usize * BYTES_PER_SAMPLE;

/// Handles belonging to one negotiated connection.
#[derive(Clone)]
struct PeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    events_channel: Arc<RTCDataChannel>,
    audio_track: Arc<TrackLocalStaticSample>,
    /// Cancels the remote-track reader and RTCP drain tasks.
    tasks: CancellationToken,
}

/// Peer-connection transport to the realtime service.
pub struct PeerTransport {
    options: TransportOptions,
    http_client: Client,
    hub: Arc<TransportEventHub>,
    capture: Option<Arc<dyn AudioCapture>>,
    session: Mutex<Option<PeerSession>>,
    capture_pump: Mutex<Option<CancellationToken>>,
    /// Set once the data channel opened; losses before that are handshake failures.
    established: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
    capturing: AtomicBool,
}

impl PeerTransport {
    pub fn new(options: TransportOptions) -> TransportResult<Self> {
        let http_client = Client::builder()
            .timeout(options.handshake_timeout)
            .build()
            .map_err(|e| TransportError::connect(TransportType::Peer, e))?;

        Ok(Self {
            options,
            http_client,
            hub: Arc::new(TransportEventHub::new()),
            capture: None,
            session: Mutex::new(None),
            capture_pump: Mutex::new(None),
            established: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
            capturing: AtomicBool::new(false),
        })
    }

    /// Attach a capture device that feeds the local track between
    /// `start_capture` and `stop_capture`.
    pub fn with_capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn current_session(&self) -> TransportResult<PeerSession> {
        if self.hub.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.session.lock().clone().ok_or(TransportError::NotConnected)
    }

    /// Build the peer connection, local track and data channel, and wire
    /// every callback to the event hub.
    async fn build_session(&self) -> Result<(PeerSession, oneshot::Receiver<()>), webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_owned(),
                    clock_rate: PEER_SAMPLE_RATE,
                    channels: 1,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: PCMU_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .options
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );
        let tasks = CancellationToken::new();

        // Local microphone track
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PEER_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "parli".to_owned(),
        ));
        let rtp_sender = peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be read for interceptors to work
        let drain_cancel = tasks.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    read = rtp_sender.read(&mut buf) => {
                        if read.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Remote translated audio
        let hub = self.hub.clone();
        let track_cancel = tasks.clone();
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let hub = hub.clone();
            let cancel = track_cancel.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                info!(
                    "Remote audio track received ({})",
                    track.codec().capability.mime_type
                );
                tokio::spawn(read_remote_track(track, hub, cancel));
            })
        }));

        // Connection health
        let hub = self.hub.clone();
        let established = self.established.clone();
        let intentional = self.intentional_close.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!("Peer connection state changed: {}", state);
                let lost = match state {
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        Some(TransportState::Disconnected)
                    }
                    _ => None,
                };
                if let Some(next) = lost
                    && established.load(Ordering::SeqCst)
                    && !intentional.load(Ordering::SeqCst)
                {
                    warn!("Peer connection lost ({})", next);
                    hub.set_state(next);
                }
                Box::pin(async {})
            },
        ));

        // Event channel
        let events_channel = peer_connection
            .create_data_channel(EVENTS_CHANNEL_LABEL, None)
            .await?;

        let (open_tx, open_rx) = oneshot::channel::<()>();
        let open_tx = Arc::new(Mutex::new(Some(open_tx)));
        events_channel.on_open(Box::new(move || {
            if let Some(tx) = open_tx.lock().take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let hub = self.hub.clone();
        events_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            match std::str::from_utf8(&msg.data) {
                Ok(text) => hub.publish_frame(text),
                Err(e) => debug!("Dropping non-UTF-8 data channel message: {}", e),
            }
            Box::pin(async {})
        }));

        let hub = self.hub.clone();
        let established = self.established.clone();
        let intentional = self.intentional_close.clone();
        events_channel.on_close(Box::new(move || {
            if established.load(Ordering::SeqCst) && !intentional.load(Ordering::SeqCst) {
                warn!("Peer event channel closed");
                hub.set_state(TransportState::Disconnected);
            }
            Box::pin(async {})
        }));

        Ok((
            PeerSession {
                peer_connection,
                events_channel,
                audio_track,
                tasks,
            },
            open_rx,
        ))
    }

    /// Offer → POST → answer → data channel open.
    async fn negotiate(
        &self,
        session: &PeerSession,
        open_rx: oneshot::Receiver<()>,
        credential: &Credential,
    ) -> TransportResult<()> {
        let pc = &session.peer_connection;
        let fail = |e: webrtc::Error| TransportError::connect(TransportType::Peer, e);

        let offer = pc.create_offer(None).await.map_err(fail)?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.map_err(fail)?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Handshake("missing local description".to_string()))?;

        let url = self.options.endpoints.peer_url();
        debug!("Posting SDP offer to {}", url);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(credential.token())
            .header(CONTENT_TYPE, "application/sdp")
            .body(local.sdp)
            .send()
            .await
            .map_err(|e| TransportError::connect(TransportType::Peer, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::connect(TransportType::Peer, e))?;
        if !status.is_success() {
            return Err(TransportError::connect(
                TransportType::Peer,
                format!("SDP exchange returned {status}: {body}"),
            ));
        }

        let answer = RTCSessionDescription::answer(body)
            .map_err(|e| TransportError::Handshake(format!("invalid answer SDP: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::Handshake(format!("invalid answer SDP: {e}")))?;

        open_rx
            .await
            .map_err(|_| TransportError::Handshake("event channel never opened".to_string()))
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.capture_pump.lock().take() {
            pump.cancel();
        }
    }
}

/// Write 16kHz PCM16 to the local track as 20ms u-law samples.
async fn write_pcm(track: &TrackLocalStaticSample, pcm: &[u8]) -> TransportResult<()> {
    for frame in pcm.chunks(FRAME_BYTES) {
        let sample = Sample {
            data: audio::encode_peer_payload(frame),
            duration: audio::pcm16_duration(frame.len(), SAMPLE_RATE),
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| TransportError::connect(TransportType::Peer, e))?;
    }
    Ok(())
}

async fn read_remote_track(
    track: Arc<TrackRemote>,
    hub: Arc<TransportEventHub>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => {
                    if packet.payload.is_empty() {
                        continue;
                    }
                    hub.publish(TransportEvent::Audio(AudioChunk {
                        data: audio::decode_peer_payload(&packet.payload),
                        sample_rate: SAMPLE_RATE,
                        response_id: None,
                    }));
                }
                Err(e) => {
                    debug!("Remote track ended: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for PeerTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Peer
    }

    async fn connect(&self, credential: &Credential) -> TransportResult<()> {
        if self.hub.state() == TransportState::Connected {
            return Ok(());
        }

        self.intentional_close.store(false, Ordering::SeqCst);
        self.established.store(false, Ordering::SeqCst);
        self.hub.set_state(TransportState::Connecting);

        let deadline = Instant::now() + self.options.handshake_timeout;
        let (session, open_rx) = match self.build_session().await {
            Ok(built) => built,
            Err(e) => {
                warn!("Failed to build peer connection: {}", e);
                self.hub.set_state(TransportState::Failed);
                return Err(TransportError::connect(TransportType::Peer, e));
            }
        };

        let outcome = timeout_at(deadline, self.negotiate(&session, open_rx, credential))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::connect(
                    TransportType::Peer,
                    "handshake timed out",
                ))
            });

        if let Err(e) = outcome {
            warn!("Peer transport connect failed: {}", e);
            session.tasks.cancel();
            let _ = timeout(
                self.options.close_timeout,
                session.peer_connection.close(),
            )
            .await;
            self.hub.set_state(TransportState::Failed);
            return Err(e);
        }

        *self.session.lock() = Some(session);
        self.established.store(true, Ordering::SeqCst);
        self.hub.set_state(TransportState::Connected);
        info!("Connected to realtime service over peer transport");
        Ok(())
    }

    async fn send_message(&self, event: ClientEvent) -> TransportResult<()> {
        let session = self.current_session()?;
        let json = serde_json::to_string(&event)?;
        session
            .events_channel
            .send_text(json)
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("Failed to send on event channel: {}", e);
                TransportError::Closed
            })
    }

    async fn send_audio(&self, pcm: Bytes) -> TransportResult<()> {
        let session = self.current_session()?;
        write_pcm(&session.audio_track, &pcm).await
    }

    /// The media track has no discrete buffers; the turn ends when capture stops.
    async fn commit_turn(&self) -> TransportResult<()> {
        self.current_session()?;
        self.stop_capture().await
    }

    async fn start_capture(&self) -> TransportResult<()> {
        let session = self.current_session()?;
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(capture) = self.capture.clone() else {
            // Audio is pushed through send_audio
            return Ok(());
        };

        let mut frames = match capture.start().await {
            Ok(frames) => frames,
            Err(e) => {
                self.capturing.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let pump = CancellationToken::new();
        *self.capture_pump.lock() = Some(pump.clone());

        let track = session.audio_track.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(pcm) => {
                            if let Err(e) = write_pcm(&track, &pcm).await {
                                warn!("Capture pump stopped: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Capture pump finished");
        });
        Ok(())
    }

    async fn stop_capture(&self) -> TransportResult<()> {
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_pump();
        if let Some(capture) = &self.capture {
            capture.stop().await;
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.intentional_close.store(true, Ordering::SeqCst);
        let _ = self.stop_capture().await;

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.tasks.cancel();
            match timeout(self.options.close_timeout, session.peer_connection.close()).await {
                Ok(Err(e)) => warn!("Error closing peer connection: {}", e),
                Err(_) => warn!("Peer connection close timed out"),
                Ok(Ok(())) => {}
            }
        }

        self.established.store(false, Ordering::SeqCst);
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
