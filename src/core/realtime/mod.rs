//! Realtime speech-to-speech protocol: endpoints and JSON events shared by
//! both transports.

pub mod config;
pub mod messages;

pub use config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, EVENTS_CHANNEL_LABEL, Modality,
    OPENAI_BETA_HEADER, REALTIME_WEBRTC_URL, REALTIME_WS_URL, RealtimeEndpoints, RealtimeVoice,
};
pub use messages::{
    ApiError, ClientEvent, InputAudioTranscription, ResponseInfo, ServerEvent, SessionConfig,
    SessionInfo,
};
