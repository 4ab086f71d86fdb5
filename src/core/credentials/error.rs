use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Classification of credential failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialErrorKind {
    /// HTTP 401 from the issuance endpoint
    Unauthorized,
    /// HTTP 429, optionally with a retry-after hint
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// Timeout or connection failure
    NetworkError,
    /// Malformed or missing response fields
    ParseError,
    /// Anything else
    Unknown,
}

impl CredentialErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::ParseError => "parse_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a failure of this kind is worth retrying locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError | Self::NetworkError
        )
    }
}

impl fmt::Display for CredentialErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by credential sources.
///
/// `Clone` so one in-flight refresh can hand the same failure to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("credential {kind}: {message}")]
pub struct CredentialError {
    pub kind: CredentialErrorKind,
    pub message: String,
    /// Server-provided wait before retrying (rate limiting only).
    pub retry_after: Option<Duration>,
}

impl CredentialError {
    pub fn new(kind: CredentialErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::Unauthorized, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(CredentialErrorKind::RateLimited, message)
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::ServerError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::NetworkError, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::ParseError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::Unknown, message)
    }

    /// Classify a non-success HTTP status from the issuance endpoint.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        match status {
            401 => Self::unauthorized(message),
            429 => Self::rate_limited(message, retry_after),
            500..=599 => Self::server(message),
            _ => Self::unknown(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::network(err.to_string())
        } else if err.is_decode() {
            Self::parse(err.to_string())
        } else {
            Self::unknown(err.to_string())
        }
    }
}

pub type CredentialResult<T> = Result<T, CredentialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            CredentialError::from_status(401, "", None).kind,
            CredentialErrorKind::Unauthorized
        );
        let limited = CredentialError::from_status(429, "slow down", Some(Duration::from_secs(3)));
        assert_eq!(limited.kind, CredentialErrorKind::RateLimited);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(
            CredentialError::from_status(503, "", None).kind,
            CredentialErrorKind::ServerError
        );
        assert_eq!(
            CredentialError::from_status(404, "", None).kind,
            CredentialErrorKind::Unknown
        );
    }

    #[test]
    fn test_retryability() {
        assert!(CredentialErrorKind::RateLimited.is_retryable());
        assert!(CredentialErrorKind::ServerError.is_retryable());
        assert!(CredentialErrorKind::NetworkError.is_retryable());
        assert!(!CredentialErrorKind::Unauthorized.is_retryable());
        assert!(!CredentialErrorKind::ParseError.is_retryable());
        assert!(!CredentialErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = CredentialError::parse("missing token");
        assert_eq!(err.to_string(), "credential parse_error: missing token");
    }
}
