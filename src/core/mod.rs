pub mod audio;
pub mod backoff;
pub mod credentials;
pub mod realtime;
pub mod session;
pub mod transport;
pub mod turn;

// Re-export commonly used types for convenience
pub use backoff::BackoffPolicy;

pub use credentials::{
    Credential, CredentialError, CredentialErrorKind, CredentialProvider,
    CredentialProviderConfig, CredentialResult, CredentialSource,
};

pub use realtime::{ClientEvent, RealtimeEndpoints, RealtimeVoice, ServerEvent, SessionConfig};

pub use transport::{
    AudioCapture, AudioChunk, DefaultTransportFactory, ManagerEvent, Transport, TransportError,
    TransportFactory, TransportManager, TransportOptions, TransportResult, TransportState,
    TransportStatus, TransportType,
};

pub use session::{
    CoordinatorConfig, CoordinatorError, CoordinatorResult, CredentialPolicy, DirectionalEvent,
    DualSessionCoordinator, SessionDirection, SessionEvent, SessionState, SessionStatus,
};

pub use turn::{TurnController, TurnError, TurnOptions, TurnResult, TurnSignal, TurnState};
