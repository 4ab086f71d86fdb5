//! Transport contract shared by the peer and stream implementations.
//!
//! # Audio Format
//!
//! `send_audio` takes and `TransportEvent::Audio` yields PCM 16-bit signed
//! little-endian, mono, 16kHz regardless of what travels on the wire.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::audio::{self, SAMPLE_RATE};
use crate::core::credentials::{Credential, CredentialError};
use crate::core::realtime::{ClientEvent, RealtimeEndpoints, ServerEvent};

/// Capacity of every per-transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Default bound on a connection handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on closing a transport.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{transport} connection failed: {reason}")]
    ConnectFailed {
        transport: TransportType,
        reason: String,
    },

    #[error("Not connected")]
    NotConnected,

    #[error(
        "Both transports failed: {primary} ({primary_error}); {fallback} ({fallback_error})"
    )]
    CompoundFailure {
        primary: TransportType,
        primary_error: String,
        fallback: TransportType,
        fallback_error: String,
    },

    #[error("{0} not yet supported")]
    Unsupported(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    pub fn connect(transport: TransportType, reason: impl fmt::Display) -> Self {
        Self::ConnectFailed {
            transport,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Transport Kinds And States
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    None,
    /// Low-latency peer connection (media track + data channel)
    Peer,
    /// Streaming WebSocket
    Stream,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Peer => "peer",
            Self::Stream => "stream",
        }
    }

    /// The other concrete transport; `None` has no alternate.
    pub fn alternate(&self) -> Self {
        match self {
            Self::Peer => Self::Stream,
            Self::Stream => Self::Peer,
            Self::None => Self::None,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    /// Terminal for one connection-attempt sequence.
    Failed,
}

impl TransportState {
    /// Whether this state means an established connection was lost.
    pub fn is_loss(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error | Self::Failed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Decoded audio from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// PCM16 LE mono
    pub data: Bytes,
    pub sample_rate: u32,
    pub response_id: Option<String>,
}

/// Everything a transport reports, on one ordered channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerEvent),
    Audio(AudioChunk),
    State(TransportState),
}

/// Settings shared by both transport implementations.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub endpoints: RealtimeEndpoints,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    /// STUN/TURN URLs for the peer transport.
    pub ice_servers: Vec<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            endpoints: RealtimeEndpoints::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            ice_servers: Vec::new(),
        }
    }
}

// =============================================================================
// Event Hub
// =============================================================================

/// State cell plus broadcast sender used by transport implementations.
///
/// State changes are published on the same channel as messages and audio, so
/// subscribers observe them in arrival order.
pub struct TransportEventHub {
    state: RwLock<TransportState>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for TransportEventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportEventHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(TransportState::Disconnected),
            events,
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    /// Update the state, publishing only actual transitions.
    pub fn set_state(&self, next: TransportState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            *state = next;
        }
        let _ = self.events.send(TransportEvent::State(next));
    }

    pub fn publish(&self, event: TransportEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Decode one inbound JSON frame and publish it.
    ///
    /// Audio deltas are published as decoded [`AudioChunk`]s; unknown and
    /// unparseable events are dropped.
    pub fn publish_frame(&self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("Skipping unparseable server event: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => match audio::decode_base64(&delta) {
                Ok(data) => self.publish(TransportEvent::Audio(AudioChunk {
                    data: Bytes::from(data),
                    sample_rate: SAMPLE_RATE,
                    response_id: Some(response_id).filter(|id| !id.is_empty()),
                })),
                Err(e) => warn!("Dropping undecodable audio delta: {}", e),
            },
            ServerEvent::Unknown => {}
            other => {
                if let ServerEvent::Error { error } = &other {
                    warn!("Realtime service error: {}", error);
                }
                self.publish(TransportEvent::Message(other));
            }
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Uniform contract over the peer connection and the streaming socket.
///
/// Methods take `&self`; implementations keep their mutable state behind
/// locks so a transport can be shared as `Arc<dyn Transport>` between its
/// manager and the manager's monitor task.
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Establish the connection with the given bearer credential.
    async fn connect(&self, credential: &Credential) -> TransportResult<()>;

    /// Send one JSON event. `NotConnected` without an open channel.
    async fn send_message(&self, event: ClientEvent) -> TransportResult<()>;

    /// Send PCM16 16kHz mono audio.
    async fn send_audio(&self, pcm: Bytes) -> TransportResult<()>;

    /// Mark the end of the speaker's turn.
    async fn commit_turn(&self) -> TransportResult<()>;

    async fn start_capture(&self) -> TransportResult<()>;

    async fn stop_capture(&self) -> TransportResult<()>;

    /// Release everything. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    fn state(&self) -> TransportState;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
