//! Configuration for the Parli orchestrator
//!
//! Configuration comes from .env files, YAML files and environment variables.
//! Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: `PARLI_*` environment variable access
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use parli_realtime::config::OrchestratorConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = OrchestratorConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("parli.yaml");
//! let config = OrchestratorConfig::from_file(&config_path)?;
//!
//! println!("Translating {} <-> {}", config.language_a, config.language_b);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

mod env;
mod merge;
mod validation;
mod yaml;

pub use env::ENV_PREFIX;
pub use yaml::YamlConfig;

use crate::core::backoff::BackoffPolicy;
use crate::core::credentials::{
    CredentialProviderConfig, DEFAULT_REFRESH_MARGIN, DEFAULT_REQUEST_TIMEOUT,
};
use crate::core::realtime::{
    DEFAULT_REALTIME_MODEL, REALTIME_WEBRTC_URL, REALTIME_WS_URL, RealtimeEndpoints,
    RealtimeVoice,
};
use crate::core::session::{CoordinatorConfig, CredentialPolicy};
use crate::core::transport::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, TransportOptions};
use crate::core::turn::{DEFAULT_HOLD_THRESHOLD, TurnOptions};
use crate::utils::EndpointKind;

/// Token service used when nothing is configured.
pub const DEFAULT_TOKEN_SERVICE_URL: &str = "http://localhost:8000";

/// Orchestrator configuration
///
/// Contains everything needed to run both translation directions:
/// - Token service location, app key and credential policy
/// - Realtime service endpoints, model and voice
/// - Language pair
/// - Transport preferences, timeouts and retry backoff
/// - Push-to-talk timing
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Credentials
    pub token_service_url: String,
    /// Bearer key for the token service. Zeroized on drop.
    pub token_service_key: Option<String>,
    pub credential_timeout: Duration,
    pub refresh_margin: Duration,
    pub credential_policy: CredentialPolicy,

    // Realtime service
    pub realtime_model: String,
    pub voice: RealtimeVoice,
    pub realtime_ws_url: String,
    pub realtime_webrtc_url: String,
    pub transcription_model: Option<String>,

    // Languages
    /// Forward source / reverse target
    pub language_a: String,
    /// Forward target / reverse source
    pub language_b: String,

    // Transport
    pub prefer_stream: bool,
    pub backoff: BackoffPolicy,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    /// STUN/TURN URLs for the peer transport
    pub ice_servers: Vec<String>,
    /// Accept http/ws endpoints on loopback hosts
    pub allow_insecure_endpoints: bool,

    // Turn
    pub hold_threshold: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_service_url: DEFAULT_TOKEN_SERVICE_URL.to_string(),
            token_service_key: None,
            credential_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            credential_policy: CredentialPolicy::default(),
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: RealtimeVoice::default(),
            realtime_ws_url: REALTIME_WS_URL.to_string(),
            realtime_webrtc_url: REALTIME_WEBRTC_URL.to_string(),
            transcription_model: None,
            language_a: "en".to_string(),
            language_b: "es".to_string(),
            prefer_stream: false,
            backoff: BackoffPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            allow_insecure_endpoints: false,
            hold_threshold: DEFAULT_HOLD_THRESHOLD,
        }
    }
}

/// Zeroize the token service key when the configuration is dropped.
impl Drop for OrchestratorConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.token_service_key {
            key.zeroize();
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from `PARLI_*` environment variables over defaults.
    ///
    /// The .env file is loaded by the binary at startup, so its values appear
    /// here as environment variables.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variables as base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Check endpoints, languages and backoff values.
    pub fn validate(&self) -> Result<(), String> {
        let insecure = self.allow_insecure_endpoints;
        validation::validate_endpoint(
            "token service URL",
            &self.token_service_url,
            EndpointKind::Http,
            insecure,
        )?;
        validation::validate_endpoint(
            "realtime WebSocket URL",
            &self.realtime_ws_url,
            EndpointKind::WebSocket,
            insecure,
        )?;
        validation::validate_endpoint(
            "realtime WebRTC URL",
            &self.realtime_webrtc_url,
            EndpointKind::Http,
            insecure,
        )?;
        validation::validate_languages(&self.language_a, &self.language_b)?;
        validation::validate_backoff(&self.backoff)?;
        if self.realtime_model.trim().is_empty() {
            return Err("Realtime model must not be empty".to_string());
        }
        Ok(())
    }

    pub fn credential_provider_config(&self) -> CredentialProviderConfig {
        CredentialProviderConfig {
            endpoint: self.token_service_url.clone(),
            app_key: self.token_service_key.clone().map(Zeroizing::new),
            request_timeout: self.credential_timeout,
            refresh_margin: self.refresh_margin,
            backoff: self.backoff.clone(),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            endpoints: RealtimeEndpoints {
                ws_url: self.realtime_ws_url.clone(),
                webrtc_url: self.realtime_webrtc_url.clone(),
                model: self.realtime_model.clone(),
            },
            handshake_timeout: self.handshake_timeout,
            close_timeout: self.close_timeout,
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            language_a: self.language_a.clone(),
            language_b: self.language_b.clone(),
            voice: self.voice,
            transcription_model: self.transcription_model.clone(),
            prefer_stream: self.prefer_stream,
            credential_policy: self.credential_policy,
            backoff: self.backoff.clone(),
            close_timeout: self.close_timeout,
        }
    }

    pub fn turn_options(&self) -> TurnOptions {
        TurnOptions {
            hold_threshold: self.hold_threshold,
        }
    }
}
