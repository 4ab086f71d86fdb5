//! Ephemeral credentials for the realtime service.
//!
//! The [`CredentialProvider`] mints short-lived tokens from the token service
//! (`POST /realtime/ephemeral`), caches the latest one and refreshes it before
//! it gets within the refresh margin of expiry.

mod credential;
mod error;
mod provider;

pub use credential::{Credential, DEFAULT_TOKEN_TYPE, parse_expiry};
pub use error::{CredentialError, CredentialErrorKind, CredentialResult};
pub use provider::{
    CredentialProvider, CredentialProviderConfig, CredentialSource, DEFAULT_REFRESH_MARGIN,
    DEFAULT_REQUEST_TIMEOUT, EPHEMERAL_PATH,
};
