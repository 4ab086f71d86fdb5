//! Bidirectional translation: one realtime session per direction.

mod coordinator;
mod direction;

pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorResult, DualSessionCoordinator,
};
pub use direction::{
    CredentialPolicy, DirectionalEvent, LanguagePair, SessionDirection, SessionEvent,
    SessionState, SessionStatus, language_name,
};
