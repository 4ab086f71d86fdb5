//! Realtime protocol events.
//!
//! Every event is a JSON object discriminated by its `type` field. The same
//! events travel over the streaming socket and the peer data channel.
//!
//! Outbound (client → service):
//! - session.update
//! - input_audio_buffer.append / .commit / .clear
//! - response.create / response.cancel
//!
//! Inbound (service → client), the subset the orchestrator acts on:
//! - session.created / session.updated
//! - conversation.item.input_audio_transcription.delta / .completed / .failed
//! - response.created / response.audio.delta / response.audio.done / response.done
//! - response.audio_transcript.delta / .done
//! - error
//!
//! Anything else decodes as [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

use super::config::{DEFAULT_TRANSCRIPTION_MODEL, Modality, RealtimeVoice};
use crate::core::audio::{self, PCM16_FORMAT};

// =============================================================================
// Session Configuration
// =============================================================================

/// Payload of `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<RealtimeVoice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// `None` is sent as `null`, which disables server-side turn detection.
    /// Turns are delimited by explicit commits instead.
    #[serde(default)]
    pub turn_detection: Option<serde_json::Value>,
}

impl SessionConfig {
    /// Audio+text translation session with PCM16 both ways and manual turns.
    pub fn translation(
        instructions: impl Into<String>,
        voice: RealtimeVoice,
        transcription_model: Option<&str>,
    ) -> Self {
        Self {
            modalities: Some(vec![Modality::Audio, Modality::Text]),
            instructions: Some(instructions.into()),
            voice: Some(voice),
            input_audio_format: Some(PCM16_FORMAT.to_string()),
            output_audio_format: Some(PCM16_FORMAT.to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: transcription_model
                    .unwrap_or(DEFAULT_TRANSCRIPTION_MODEL)
                    .to_string(),
            }),
            turn_detection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

// =============================================================================
// Client Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64-framed PCM16 audio.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Ask for a response using the session defaults.
    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// `input_audio_buffer.append` carrying raw PCM16 bytes.
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: audio::encode_base64(pcm),
        }
    }

    /// `response.create` with the session defaults.
    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::InputAudioBufferClear => "input_audio_buffer.clear",
            Self::ResponseCreate => "response.create",
            Self::ResponseCancel => "response.cancel",
        }
    }
}

// =============================================================================
// Server Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: String,
    },

    /// Partial transcription of the speaker's input.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: String,
        delta: String,
    },

    /// Final transcription of the speaker's input.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: String,
        error: ApiError,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    /// Base64-encoded PCM16 chunk of translated speech.
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: String,
        transcript: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            Self::TranscriptionDelta { .. } => {
                "conversation.item.input_audio_transcription.delta"
            }
            Self::TranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::TranscriptionFailed { .. } => {
                "conversation.item.input_audio_transcription.failed"
            }
            Self::ResponseCreated { .. } => "response.created",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::AudioDone { .. } => "response.audio.done",
            Self::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            Self::ResponseDone { .. } => "response.done",
            Self::Unknown => "unknown",
        }
    }

    /// Parse one inbound frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event_id: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({}): {}", self.error_type, code, self.message),
            None => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
}
