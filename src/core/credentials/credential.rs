use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};
use zeroize::Zeroizing;

use super::error::{CredentialError, CredentialResult};

/// Token kind reported when the issuance endpoint omits `token_type`.
pub const DEFAULT_TOKEN_TYPE: &str = "ephemeral";

/// A short-lived bearer credential for the realtime service.
///
/// The token lives in zeroizing storage, so every clone wipes its copy on drop.
#[derive(Clone)]
pub struct Credential {
    token: Zeroizing<String>,
    token_type: String,
    expires_at: OffsetDateTime,
}

impl Credential {
    pub fn new(
        token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
            token_type: token_type.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// `Authorization` header value. Zeroized when dropped.
    pub fn bearer(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("Bearer {}", self.token.as_str()))
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        let left = self.expires_at - OffsetDateTime::now_utc();
        left.try_into().unwrap_or(Duration::ZERO)
    }

    /// True while more than `margin` remains before expiry.
    pub fn is_valid_with_margin(&self, margin: Duration) -> bool {
        self.remaining() > margin
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Response body of `POST /realtime/ephemeral`.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    token: String,
    expires_at: String,
    #[serde(default)]
    token_type: Option<String>,
}

impl TokenResponse {
    pub(crate) fn parse(body: &str) -> CredentialResult<Credential> {
        let response: TokenResponse = serde_json::from_str(body)
            .map_err(|e| CredentialError::parse(format!("Invalid token response: {e}")))?;

        let token = Zeroizing::new(response.token);
        if token.trim().is_empty() {
            return Err(CredentialError::parse("Token response has an empty token"));
        }

        let expires_at = parse_expiry(&response.expires_at)?;
        let token_type = response
            .token_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        Ok(Credential {
            token,
            token_type,
            expires_at,
        })
    }
}

/// Parse an RFC 3339 / ISO 8601 expiry. Timestamps without an offset are UTC.
pub fn parse_expiry(value: &str) -> CredentialResult<OffsetDateTime> {
    if let Ok(at) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(at);
    }
    if let Ok(at) = OffsetDateTime::parse(value, &Iso8601::DEFAULT) {
        return Ok(at);
    }
    PrimitiveDateTime::parse(value, &Iso8601::DEFAULT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| CredentialError::parse(format!("Invalid expires_at '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_margin() {
        let now = OffsetDateTime::now_utc();
        let fresh = Credential::new("tok", "ephemeral", now + time::Duration::minutes(5));
        assert!(fresh.is_valid_with_margin(Duration::from_secs(30)));

        let near = Credential::new("tok", "ephemeral", now + time::Duration::seconds(20));
        assert!(!near.is_valid_with_margin(Duration::from_secs(30)));

        let expired = Credential::new("tok", "ephemeral", now - time::Duration::seconds(1));
        assert_eq!(expired.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new("secret-token", "ephemeral", OffsetDateTime::now_utc());
        let debug = format!("{credential:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_parse_response_defaults_token_type() {
        let credential =
            TokenResponse::parse(r#"{"token":"abc","expires_at":"2030-01-01T00:05:00Z"}"#)
                .unwrap();
        assert_eq!(credential.token(), "abc");
        assert_eq!(credential.token_type(), DEFAULT_TOKEN_TYPE);
        assert_eq!(credential.expires_at().year(), 2030);
        assert_eq!(credential.bearer().as_str(), "Bearer abc");
    }

    #[test]
    fn test_parse_response_rejects_bad_bodies() {
        assert!(TokenResponse::parse(r#"{"expires_at":"2030-01-01T00:00:00Z"}"#).is_err());
        assert!(TokenResponse::parse(r#"{"token":"","expires_at":"2030-01-01T00:00:00Z"}"#).is_err());
        assert!(TokenResponse::parse(r#"{"token":"abc","expires_at":"tomorrow"}"#).is_err());
        assert!(TokenResponse::parse("not json").is_err());
    }

    #[test]
    fn test_parse_expiry_formats() {
        assert!(parse_expiry("2030-01-01T00:05:00+00:00").is_ok());
        assert!(parse_expiry("2030-01-01T00:05:00.123456Z").is_ok());
        let naive = parse_expiry("2030-01-01T00:05:00.123456").unwrap();
        assert_eq!(naive.offset(), time::UtcOffset::UTC);
    }
}
