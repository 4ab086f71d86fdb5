//! Realtime service endpoints, voices and modalities.

use serde::{Deserialize, Serialize};

/// Streaming socket endpoint.
pub const REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// Peer connection SDP exchange endpoint.
pub const REALTIME_WEBRTC_URL: &str = "https://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default input transcription model.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Beta header required by the streaming endpoint.
pub const OPENAI_BETA_HEADER: (&str, &str) = ("openai-beta", "realtime=v1");

/// Label of the data channel carrying JSON events on the peer transport.
pub const EVENTS_CHANNEL_LABEL: &str = "oai-events";

// =============================================================================
// Endpoints
// =============================================================================

/// Where and against which model both transports connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEndpoints {
    pub ws_url: String,
    pub webrtc_url: String,
    pub model: String,
}

impl Default for RealtimeEndpoints {
    fn default() -> Self {
        Self {
            ws_url: REALTIME_WS_URL.to_string(),
            webrtc_url: REALTIME_WEBRTC_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
        }
    }
}

impl RealtimeEndpoints {
    /// `wss://...?model=<model>`
    pub fn stream_url(&self) -> String {
        with_model(&self.ws_url, &self.model)
    }

    /// `https://...?model=<model>`
    pub fn peer_url(&self) -> String {
        with_model(&self.webrtc_url, &self.model)
    }
}

fn with_model(base: &str, model: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}model={model}")
}

// =============================================================================
// Voices
// =============================================================================

/// Output voices offered by the realtime service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeVoice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl RealtimeVoice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ash" => Self::Ash,
            "ballad" => Self::Ballad,
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::Alloy,
        }
    }
}

impl std::fmt::Display for RealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Modalities
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls_carry_model() {
        let endpoints = RealtimeEndpoints::default();
        assert_eq!(
            endpoints.stream_url(),
            format!("wss://api.openai.com/v1/realtime?model={DEFAULT_REALTIME_MODEL}")
        );
        assert!(endpoints.peer_url().starts_with("https://api.openai.com/v1/realtime?model="));

        let custom = RealtimeEndpoints {
            ws_url: "ws://127.0.0.1:9000/rt?x=1".to_string(),
            model: "m".to_string(),
            ..Default::default()
        };
        assert_eq!(custom.stream_url(), "ws://127.0.0.1:9000/rt?x=1&model=m");
    }

    #[test]
    fn test_voice_from_str() {
        assert_eq!(RealtimeVoice::from_str_or_default("SHIMMER"), RealtimeVoice::Shimmer);
        assert_eq!(RealtimeVoice::from_str_or_default("nobody"), RealtimeVoice::Alloy);
        assert_eq!(RealtimeVoice::Verse.to_string(), "verse");
    }

    #[test]
    fn test_modality_as_str() {
        assert_eq!(Modality::Audio.as_str(), "audio");
        assert_eq!(Modality::Text.as_str(), "text");
    }
}
