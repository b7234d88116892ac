//! Endpoint value type and the registry value format

use serde::{Deserialize, Serialize};
use std::fmt;

/// One concrete network address serving a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: String,
}

impl Endpoint {
    /// Create new endpoint
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    /// Parse a single `host:port` token.
    ///
    /// Both components are trimmed. Returns `None` unless the token splits
    /// into exactly two non-empty components, so bracketed IPv6 literals are
    /// not accepted.
    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split(':');
        let host = parts.next()?.trim();
        let port = parts.next()?.trim();

        if parts.next().is_some() || host.is_empty() || port.is_empty() {
            return None;
        }

        Some(Self::new(host, port))
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, as written in the registry value
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Split into `(host, port)`
    pub fn into_parts(self) -> (String, String) {
        (self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a registry value into an ordered endpoint list.
///
/// The value is a comma-separated list of `host:port` tokens. Malformed tokens
/// are dropped; the order of the remaining ones is kept.
///
/// ```rust
/// use signpost_discovery::{parse_endpoint_list, Endpoint};
///
/// let endpoints = parse_endpoint_list("10.0.0.1:8080, 10.0.0.2: 8081");
/// assert_eq!(endpoints, vec![
///     Endpoint::new("10.0.0.1", "8080"),
///     Endpoint::new("10.0.0.2", "8081"),
/// ]);
/// ```
pub fn parse_endpoint_list(raw: &str) -> Vec<Endpoint> {
    raw.split(',').filter_map(Endpoint::parse).collect()
}
