use std::time::Duration;

use super::OrchestratorConfig;
use super::env::{env_bool, env_list, env_parse, env_string};
use super::yaml::YamlConfig;
use crate::core::backoff::BackoffPolicy;
use crate::core::realtime::RealtimeVoice;
use crate::core::session::CredentialPolicy;

/// Build the configuration: YAML values over environment values over defaults.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let yaml = yaml.unwrap_or_default();
    let credentials = yaml.credentials.unwrap_or_default();
    let realtime = yaml.realtime.unwrap_or_default();
    let languages = yaml.languages.unwrap_or_default();
    let transport = yaml.transport.unwrap_or_default();
    let backoff = transport.backoff.clone().unwrap_or_default();
    let turn = yaml.turn.unwrap_or_default();

    let defaults = OrchestratorConfig::default();
    let default_backoff = BackoffPolicy::default();

    let credential_policy = match credentials.policy.or_else(|| env_string("CREDENTIAL_POLICY")) {
        Some(raw) => raw.parse::<CredentialPolicy>()?,
        None => defaults.credential_policy,
    };

    let voice = realtime
        .voice
        .or_else(|| env_string("REALTIME_VOICE"))
        .map(|v| RealtimeVoice::from_str_or_default(&v))
        .unwrap_or(defaults.voice);

    let config = OrchestratorConfig {
        token_service_url: credentials
            .service_url
            .or_else(|| env_string("TOKEN_SERVICE_URL"))
            .unwrap_or_else(|| defaults.token_service_url.clone()),
        token_service_key: credentials
            .service_key
            .or_else(|| env_string("TOKEN_SERVICE_KEY")),
        credential_timeout: secs(
            credentials.timeout_secs,
            env_parse("CREDENTIAL_TIMEOUT_SECS")?,
            defaults.credential_timeout,
        ),
        refresh_margin: secs(
            credentials.refresh_margin_secs,
            env_parse("REFRESH_MARGIN_SECS")?,
            defaults.refresh_margin,
        ),
        credential_policy,

        realtime_model: realtime
            .model
            .or_else(|| env_string("REALTIME_MODEL"))
            .unwrap_or_else(|| defaults.realtime_model.clone()),
        voice,
        realtime_ws_url: realtime
            .ws_url
            .or_else(|| env_string("REALTIME_WS_URL"))
            .unwrap_or_else(|| defaults.realtime_ws_url.clone()),
        realtime_webrtc_url: realtime
            .webrtc_url
            .or_else(|| env_string("REALTIME_WEBRTC_URL"))
            .unwrap_or_else(|| defaults.realtime_webrtc_url.clone()),
        transcription_model: realtime
            .transcription_model
            .or_else(|| env_string("TRANSCRIPTION_MODEL")),

        language_a: languages
            .a
            .or_else(|| env_string("LANGUAGE_A"))
            .unwrap_or_else(|| defaults.language_a.clone()),
        language_b: languages
            .b
            .or_else(|| env_string("LANGUAGE_B"))
            .unwrap_or_else(|| defaults.language_b.clone()),

        prefer_stream: match transport.prefer_stream {
            Some(v) => v,
            None => env_bool("PREFER_STREAM")?.unwrap_or(defaults.prefer_stream),
        },
        backoff: BackoffPolicy {
            initial_delay_ms: pick(
                backoff.initial_ms,
                env_parse("BACKOFF_INITIAL_MS")?,
                default_backoff.initial_delay_ms,
            ),
            max_delay_ms: pick(
                backoff.max_ms,
                env_parse("BACKOFF_MAX_MS")?,
                default_backoff.max_delay_ms,
            ),
            multiplier: default_backoff.multiplier,
            max_attempts: pick(
                backoff.max_attempts,
                env_parse("BACKOFF_MAX_ATTEMPTS")?,
                default_backoff.max_attempts,
            ),
        },
        handshake_timeout: millis(
            transport.handshake_timeout_ms,
            env_parse("HANDSHAKE_TIMEOUT_MS")?,
            defaults.handshake_timeout,
        ),
        close_timeout: millis(
            transport.close_timeout_ms,
            env_parse("CLOSE_TIMEOUT_MS")?,
            defaults.close_timeout,
        ),
        ice_servers: transport
            .ice_servers
            .or_else(|| env_list("ICE_SERVERS"))
            .unwrap_or_else(|| defaults.ice_servers.clone()),
        allow_insecure_endpoints: match transport.allow_insecure_endpoints {
            Some(v) => v,
            None => env_bool("ALLOW_INSECURE_ENDPOINTS")?.unwrap_or(false),
        },

        hold_threshold: millis(
            turn.hold_threshold_ms,
            env_parse("HOLD_THRESHOLD_MS")?,
            defaults.hold_threshold,
        ),
    };

    Ok(config)
}

fn pick<T>(yaml: Option<T>, env: Option<T>, default: T) -> T {
    yaml.or(env).unwrap_or(default)
}

fn secs(yaml: Option<u64>, env: Option<u64>, default: Duration) -> Duration {
    yaml.or(env).map(Duration::from_secs).unwrap_or(default)
}

fn millis(yaml: Option<u64>, env: Option<u64>, default: Duration) -> Duration {
    yaml.or(env).map(Duration::from_millis).unwrap_or(default)
}
