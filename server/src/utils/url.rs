//! Callback/topic URL validation and IRI normalization.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use thiserror::Error;
use url::Url;

use crate::core::constants::VALID_PORTS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("url does not parse: {0}")]
    Unparseable(String),
    #[error("scheme must be http or https, got '{0}'")]
    InvalidScheme(String),
    #[error("url fragments are not allowed")]
    FragmentPresent,
    #[error("port {0} is not in the allowed set")]
    PortNotAllowed(u16),
}

/// Characters percent-encoded in the path component during IRI
/// normalization, beyond what the `url` crate already escapes.
const PATH_EXTRA: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

/// Validates a callback or topic URL: scheme must be http/https, no
/// fragment, and (outside a development environment) the port must be in
/// the fixed allowlist.
pub fn validate_url(raw: &str, dev_mode: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw).map_err(|e| UrlValidationError::Unparseable(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlValidationError::InvalidScheme(url.scheme().to_string()));
    }
    if url.fragment().is_some() {
        return Err(UrlValidationError::FragmentPresent);
    }
    if !dev_mode {
        let port = url.port_or_known_default().unwrap_or(0);
        if !VALID_PORTS.contains(&port) {
            return Err(UrlValidationError::PortNotAllowed(port));
        }
    }
    Ok(url)
}

/// Normalizes an already-validated URL to a canonical IRI string so that
/// equivalent URLs collapse to the same hash key: re-percent-encodes the
/// path, leaves the query string as given by the caller.
pub fn normalize_iri(url: &Url) -> String {
    let mut out = String::new();
    out.push_str(url.scheme());
    out.push_str("://");
    if let Some(host) = url.host_str() {
        out.push_str(host);
    }
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(&utf8_percent_encode(url.path(), PATH_EXTRA).to_string());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_on_default_port() {
        assert!(validate_url("http://example.com/feed", false).is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert_eq!(
            validate_url("ftp://example.com/feed", false),
            Err(UrlValidationError::InvalidScheme("ftp".to_string()))
        );
    }

    #[test]
    fn rejects_fragment() {
        assert_eq!(
            validate_url("http://example.com/feed#section", false),
            Err(UrlValidationError::FragmentPresent)
        );
    }

    #[test]
    fn rejects_disallowed_port_outside_dev() {
        assert_eq!(
            validate_url("http://example.com:9999/feed", false),
            Err(UrlValidationError::PortNotAllowed(9999))
        );
    }

    #[test]
    fn allows_disallowed_port_in_dev_mode() {
        assert!(validate_url("http://example.com:9999/feed", true).is_ok());
    }

    #[test]
    fn allows_known_good_port() {
        assert!(validate_url("http://example.com:8080/feed", false).is_ok());
    }

    #[test]
    fn normalize_is_stable_for_equivalent_iris() {
        let a = validate_url("http://example.com/a%20b", false).unwrap();
        let b = validate_url("http://example.com/a%20b", false).unwrap();
        assert_eq!(normalize_iri(&a), normalize_iri(&b));
    }
}
