//! Endpoint URL validation.
//!
//! Configured endpoints must:
//! - Parse as absolute URLs with a host
//! - Use a scheme that matches the endpoint kind (`https` or `wss`)
//! - Only fall back to plain `http`/`ws` for loopback hosts, and only when
//!   insecure endpoints are explicitly allowed (local token service, mock
//!   servers in tests)

use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

/// Errors that can occur during URL validation
#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be {expected}, got: {actual}")]
    SchemeNotAllowed {
        expected: &'static str,
        actual: String,
    },

    #[error("URL must have a host")]
    MissingHost,

    #[error("Insecure {0} URL is only allowed for loopback hosts")]
    InsecureRemoteHost(String),
}

/// What an endpoint is used for, which decides the accepted schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// HTTP APIs: token service, SDP exchange
    Http,
    /// WebSocket streams
    WebSocket,
}

impl EndpointKind {
    fn secure_scheme(&self) -> &'static str {
        match self {
            EndpointKind::Http => "https",
            EndpointKind::WebSocket => "wss",
        }
    }

    fn insecure_scheme(&self) -> &'static str {
        match self {
            EndpointKind::Http => "http",
            EndpointKind::WebSocket => "ws",
        }
    }
}

/// Whether the URL targets this machine (`localhost`, 127.0.0.0/8, `::1`).
pub fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

/// Validate an endpoint URL for `kind`.
///
/// # Arguments
/// * `url_str` - The URL to validate
/// * `kind` - Whether the endpoint is an HTTP API or a WebSocket
/// * `allow_insecure` - Accept `http`/`ws` for loopback hosts
///
/// # Returns
/// * `Ok(Url)` - The parsed URL
/// * `Err(UrlValidationError)` - Why the URL was rejected
pub fn validate_endpoint_url(
    url_str: &str,
    kind: EndpointKind,
    allow_insecure: bool,
) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    if url.host().is_none() {
        return Err(UrlValidationError::MissingHost);
    }

    let scheme = url.scheme();
    if scheme == kind.secure_scheme() {
        return Ok(url);
    }

    if scheme == kind.insecure_scheme() {
        if !allow_insecure {
            return Err(UrlValidationError::SchemeNotAllowed {
                expected: kind.secure_scheme(),
                actual: scheme.to_string(),
            });
        }
        if !is_loopback_host(&url) {
            return Err(UrlValidationError::InsecureRemoteHost(scheme.to_string()));
        }
        warn!("Using insecure {} endpoint: {}", scheme, url.host_str().unwrap_or(""));
        return Ok(url);
    }

    Err(UrlValidationError::SchemeNotAllowed {
        expected: kind.secure_scheme(),
        actual: scheme.to_string(),
    })
}
