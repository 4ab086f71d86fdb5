//! Transports to the realtime service and the manager that fails over
//! between them.

pub mod base;
pub mod factory;
pub mod manager;
pub mod peer;
pub mod stream;

pub use base::{
    AudioChunk, DEFAULT_CLOSE_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, EVENT_CHANNEL_CAPACITY,
    Transport, TransportError, TransportEvent, TransportEventHub, TransportOptions,
    TransportResult, TransportState, TransportType,
};
pub use factory::{DefaultTransportFactory, TransportFactory};
pub use manager::{
    FailoverCredential, ManagerEvent, ManagerOptions, TransportManager, TransportStatus,
};
pub use peer::{AudioCapture, PeerTransport};
pub use stream::StreamTransport;
