pub mod url_validation;
pub use url_validation::{EndpointKind, UrlValidationError, is_loopback_host, validate_endpoint_url};
