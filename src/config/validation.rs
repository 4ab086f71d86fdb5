use crate::core::backoff::BackoffPolicy;
use crate::utils::{EndpointKind, validate_endpoint_url};

/// Validate one configured endpoint.
pub(super) fn validate_endpoint(
    name: &str,
    url: &str,
    kind: EndpointKind,
    allow_insecure: bool,
) -> Result<(), String> {
    validate_endpoint_url(url, kind, allow_insecure)
        .map(|_| ())
        .map_err(|e| format!("Invalid {name} '{url}': {e}"))
}

/// Both language codes must be set and distinct.
pub(super) fn validate_languages(language_a: &str, language_b: &str) -> Result<(), String> {
    if language_a.trim().is_empty() || language_b.trim().is_empty() {
        return Err("Language codes must not be empty".to_string());
    }
    if language_a.eq_ignore_ascii_case(language_b) {
        return Err(format!(
            "Language A and language B must differ (both are '{language_a}')"
        ));
    }
    Ok(())
}

pub(super) fn validate_backoff(backoff: &BackoffPolicy) -> Result<(), String> {
    if backoff.max_attempts == 0 {
        return Err("Backoff max_attempts must be at least 1".to_string());
    }
    if backoff.initial_delay_ms > backoff.max_delay_ms {
        return Err(format!(
            "Backoff initial delay ({}ms) exceeds max delay ({}ms)",
            backoff.initial_delay_ms, backoff.max_delay_ms
        ));
    }
    if backoff.multiplier < 1.0 {
        return Err(format!(
            "Backoff multiplier must be >= 1.0, got {}",
            backoff.multiplier
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_languages() {
        assert!(validate_languages("en", "es").is_ok());
        assert!(validate_languages("en", "").is_err());
        assert!(validate_languages("EN", "en").is_err());
    }

    #[test]
    fn test_validate_backoff() {
        assert!(validate_backoff(&BackoffPolicy::default()).is_ok());

        let zero = BackoffPolicy {
            max_attempts: 0,
            ..BackoffPolicy::default()
        };
        assert!(validate_backoff(&zero).is_err());

        let inverted = BackoffPolicy {
            initial_delay_ms: 5000,
            ..BackoffPolicy::default()
        };
        assert!(validate_backoff(&inverted).is_err());
    }

    #[test]
    fn test_validate_endpoint_message() {
        let err = validate_endpoint(
            "token service URL",
            "http://tokens.example.com",
            EndpointKind::Http,
            false,
        )
        .unwrap_err();
        assert!(err.contains("token service URL"));
    }
}
