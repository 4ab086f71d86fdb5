use serde::{Deserialize, Serialize};

use crate::core::realtime::ServerEvent;
use crate::core::transport::{AudioChunk, TransportState, TransportType};

/// Which way a session translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDirection {
    /// Language A → language B
    Forward,
    /// Language B → language A
    Reverse,
}

impl SessionDirection {
    pub const ALL: [SessionDirection; 2] = [SessionDirection::Forward, SessionDirection::Reverse];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionDirection::Forward => "forward",
            SessionDirection::Reverse => "reverse",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            SessionDirection::Forward => SessionDirection::Reverse,
            SessionDirection::Reverse => SessionDirection::Forward,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            SessionDirection::Forward => 0,
            SessionDirection::Reverse => 1,
        }
    }
}

impl std::fmt::Display for SessionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "forward" | "a2b" => Ok(SessionDirection::Forward),
            "reverse" | "b2a" => Ok(SessionDirection::Reverse),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Connection state of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl From<TransportState> for SessionState {
    fn from(state: TransportState) -> Self {
        match state {
            TransportState::Disconnected => SessionState::Disconnected,
            TransportState::Connecting => SessionState::Connecting,
            TransportState::Connected => SessionState::Connected,
            TransportState::Error | TransportState::Failed => SessionState::Error,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// How the two directions obtain credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Each direction mints its own credential.
    #[default]
    PerDirection,
    /// Both directions use the provider's cached credential.
    Shared,
}

impl std::str::FromStr for CredentialPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_direction" => Ok(CredentialPolicy::PerDirection),
            "shared" => Ok(CredentialPolicy::Shared),
            other => Err(format!("unknown credential policy '{other}'")),
        }
    }
}

// =============================================================================
// Languages
// =============================================================================

/// Source and target language of one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    /// Forward translates A → B, reverse B → A.
    pub fn for_direction(language_a: &str, language_b: &str, direction: SessionDirection) -> Self {
        let (source, target) = match direction {
            SessionDirection::Forward => (language_a, language_b),
            SessionDirection::Reverse => (language_b, language_a),
        };
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    /// Interpreter instructions sent in `session.update`.
    pub fn instructions(&self) -> String {
        let source = language_name(&self.source);
        let target = language_name(&self.target);
        format!(
            "You are a real-time interpreter. The speaker talks in {source}. \
             Translate everything they say into {target} and speak only the translation. \
             Do not answer questions, add commentary or explain the translation. \
             Keep names, numbers and tone intact."
        )
    }
}

/// English name for common language codes; unknown codes pass through.
pub fn language_name(code: &str) -> &str {
    let primary = code.split(['-', '_']).next().unwrap_or(code);
    match primary.to_lowercase().as_str() {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "ru" => "Russian",
        "uk" => "Ukrainian",
        "pl" => "Polish",
        "tr" => "Turkish",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "vi" => "Vietnamese",
        _ => code,
    }
}

// =============================================================================
// Events
// =============================================================================

/// Inbound payload of one direction.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(ServerEvent),
    Audio(AudioChunk),
}

/// Inbound event tagged with the direction it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalEvent {
    pub direction: SessionDirection,
    pub event: SessionEvent,
}

/// Status update of one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub direction: SessionDirection,
    pub state: SessionState,
    pub transport: TransportType,
    pub failed_over: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_languages() {
        let forward = LanguagePair::for_direction("en", "es", SessionDirection::Forward);
        assert_eq!(forward.source, "en");
        assert_eq!(forward.target, "es");

        let reverse = LanguagePair::for_direction("en", "es", SessionDirection::Reverse);
        assert_eq!(reverse.source, "es");
        assert_eq!(reverse.target, "en");
    }

    #[test]
    fn test_instructions_name_both_languages() {
        let pair = LanguagePair::for_direction("en-US", "ja", SessionDirection::Forward);
        let text = pair.instructions();
        assert!(text.contains("English"));
        assert!(text.contains("Japanese"));

        let unknown = LanguagePair::for_direction("xx", "en", SessionDirection::Forward);
        assert!(unknown.instructions().contains("xx"));
    }

    #[test]
    fn test_session_state_from_transport_state() {
        assert_eq!(SessionState::from(TransportState::Failed), SessionState::Error);
        assert_eq!(SessionState::from(TransportState::Error), SessionState::Error);
        assert_eq!(
            SessionState::from(TransportState::Connected),
            SessionState::Connected
        );
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }

    #[test]
    fn test_parse_direction_and_policy() {
        assert_eq!(
            "Reverse".parse::<SessionDirection>().unwrap(),
            SessionDirection::Reverse
        );
        assert!("sideways".parse::<SessionDirection>().is_err());
        assert_eq!(
            "per-direction".parse::<CredentialPolicy>().unwrap(),
            CredentialPolicy::PerDirection
        );
        assert_eq!(CredentialPolicy::default(), CredentialPolicy::PerDirection);
        assert_eq!(SessionDirection::Forward.opposite(), SessionDirection::Reverse);
    }
}
