use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// credentials:
///   service_url: "https://tokens.example.com"
///   service_key: "app-key"
///   timeout_secs: 10
///   refresh_margin_secs: 30
///   policy: "per_direction"
///
/// realtime:
///   model: "gpt-4o-realtime-preview-2024-12-17"
///   voice: "alloy"
///   ws_url: "wss://api.openai.com/v1/realtime"
///   webrtc_url: "https://api.openai.com/v1/realtime"
///   transcription_model: "whisper-1"
///
/// languages:
///   a: "en"
///   b: "es"
///
/// transport:
///   prefer_stream: false
///   handshake_timeout_ms: 10000
///   close_timeout_ms: 3000
///   allow_insecure_endpoints: false
///   ice_servers:
///     - "stun:stun.l.google.com:19302"
///   backoff:
///     initial_ms: 200
///     max_ms: 2000
///     max_attempts: 5
///
/// turn:
///   hold_threshold_ms: 250
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub credentials: Option<CredentialsYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub languages: Option<LanguagesYaml>,
    pub transport: Option<TransportYaml>,
    pub turn: Option<TurnYaml>,
}

/// Token service settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CredentialsYaml {
    pub service_url: Option<String>,
    /// App key sent as a bearer token to the token service
    pub service_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub refresh_margin_secs: Option<u64>,
    /// "per_direction" or "shared"
    pub policy: Option<String>,
}

/// Realtime service settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub ws_url: Option<String>,
    pub webrtc_url: Option<String>,
    pub transcription_model: Option<String>,
}

/// Language pair from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LanguagesYaml {
    pub a: Option<String>,
    pub b: Option<String>,
}

/// Transport settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TransportYaml {
    pub prefer_stream: Option<bool>,
    pub handshake_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
    pub allow_insecure_endpoints: Option<bool>,
    pub ice_servers: Option<Vec<String>>,
    pub backoff: Option<BackoffYaml>,
}

/// Retry backoff from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackoffYaml {
    pub initial_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Push-to-talk settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TurnYaml {
    pub hold_threshold_ms: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
credentials:
  service_url: "https://tokens.example.com"
  service_key: "yaml-key"
  timeout_secs: 5
  refresh_margin_secs: 45
  policy: "shared"

realtime:
  model: "custom-model"
  voice: "verse"
  transcription_model: "gpt-4o-transcribe"

languages:
  a: "fr"
  b: "de"

transport:
  prefer_stream: true
  handshake_timeout_ms: 5000
  ice_servers:
    - "stun:stun.example.com:3478"
  backoff:
    initial_ms: 100
    max_attempts: 3

turn:
  hold_threshold_ms: 400
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let credentials = config.credentials.unwrap();
        assert_eq!(
            credentials.service_url,
            Some("https://tokens.example.com".to_string())
        );
        assert_eq!(credentials.service_key, Some("yaml-key".to_string()));
        assert_eq!(credentials.timeout_secs, Some(5));
        assert_eq!(credentials.policy, Some("shared".to_string()));

        let realtime = config.realtime.unwrap();
        assert_eq!(realtime.model, Some("custom-model".to_string()));
        assert_eq!(realtime.voice, Some("verse".to_string()));
        assert!(realtime.ws_url.is_none());

        let languages = config.languages.unwrap();
        assert_eq!(languages.a, Some("fr".to_string()));
        assert_eq!(languages.b, Some("de".to_string()));

        let transport = config.transport.unwrap();
        assert_eq!(transport.prefer_stream, Some(true));
        assert_eq!(transport.handshake_timeout_ms, Some(5000));
        assert_eq!(
            transport.ice_servers,
            Some(vec!["stun:stun.example.com:3478".to_string()])
        );
        let backoff = transport.backoff.unwrap();
        assert_eq!(backoff.initial_ms, Some(100));
        assert!(backoff.max_ms.is_none());
        assert_eq!(backoff.max_attempts, Some(3));

        assert_eq!(config.turn.unwrap().hold_threshold_ms, Some(400));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.credentials.is_none());
        assert!(config.realtime.is_none());
        assert!(config.languages.is_none());
        assert!(config.transport.is_none());
        assert!(config.turn.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(&config_path, "languages:\n  a: \"it\"\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        let languages = config.languages.unwrap();
        assert_eq!(languages.a, Some("it".to_string()));
        assert!(languages.b.is_none());
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let result = YamlConfig::from_file(&path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");

        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
