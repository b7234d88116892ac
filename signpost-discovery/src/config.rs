//! Resolver configuration
//!
//! Configuration can be built in code, parsed from TOML or JSON, loaded from a
//! file (format picked by extension) or read from prefixed environment
//! variables.

use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default prefix for environment variables
pub const DEFAULT_ENV_PREFIX: &str = "SIGNPOST";

/// Resolver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Registry bootstrap addresses; empty disables the registry
    pub registry_endpoints: Vec<String>,

    /// Key prefix watched as soon as the registry connects
    pub watch_prefix: Option<String>,

    /// Bound for registry connect and fetch requests
    pub request_timeout_ms: Option<u64>,

    /// Static fallback endpoints, service id to `host:port`
    pub defaults: BTreeMap<String, String>,
}

impl ResolverConfig {
    /// Create config with the given registry bootstrap addresses
    pub fn new(registry_endpoints: Vec<String>) -> Self {
        Self {
            registry_endpoints,
            ..Self::default()
        }
    }

    /// Watch every key under `prefix` once connected
    pub fn with_watch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.watch_prefix = Some(prefix.into());
        self
    }

    /// Bound registry connect and fetch requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Add a static fallback endpoint
    pub fn with_default(
        mut self,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        let endpoint = Endpoint::new(host, port);
        self.defaults.insert(service_id.into(), endpoint.to_string());
        self
    }

    /// Configured request timeout, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Parsed fallback endpoints
    pub fn default_endpoints(&self) -> Result<Vec<(String, Endpoint)>> {
        self.defaults
            .iter()
            .map(|(id, raw)| {
                Endpoint::parse(raw)
                    .map(|endpoint| (id.clone(), endpoint))
                    .ok_or_else(|| {
                        DiscoveryError::InvalidConfiguration(format!(
                            "default endpoint for {} is not host:port: {:?}",
                            id, raw
                        ))
                    })
            })
            .collect()
    }

    /// Check the configuration for values the resolver cannot use
    pub fn validate(&self) -> Result<()> {
        if self.registry_endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(DiscoveryError::InvalidConfiguration(
                "registry endpoint must not be blank".to_string(),
            ));
        }

        if self.request_timeout_ms == Some(0) {
            return Err(DiscoveryError::InvalidConfiguration(
                "request timeout must be greater than zero".to_string(),
            ));
        }

        self.default_endpoints()?;
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DiscoveryError::InvalidConfiguration(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| DiscoveryError::InvalidConfiguration(format!("JSON parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| {
                DiscoveryError::InvalidConfiguration("No file extension found".to_string())
            })?;

        let content = std::fs::read_to_string(path)?;

        match ext.as_str() {
            "toml" => Self::from_toml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(DiscoveryError::InvalidConfiguration(format!(
                "Unsupported format: {}",
                other
            ))),
        }
    }

    /// Load from the process environment using `prefix`
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Load from an explicit set of variables.
    ///
    /// Recognized names are `{prefix}_REGISTRY_ENDPOINTS` (comma separated),
    /// `{prefix}_WATCH_PREFIX` and `{prefix}_REQUEST_TIMEOUT_MS`.
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(name) = key
                .as_ref()
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                continue;
            };
            let value: String = value.into();

            match name {
                "REGISTRY_ENDPOINTS" => {
                    config.registry_endpoints = value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "WATCH_PREFIX" if !value.is_empty() => config.watch_prefix = Some(value),
                "REQUEST_TIMEOUT_MS" => {
                    let ms = value.trim().parse().map_err(|_| {
                        DiscoveryError::InvalidConfiguration(format!(
                            "{}_REQUEST_TIMEOUT_MS is not a number: {}",
                            prefix, value
                        ))
                    })?;
                    config.request_timeout_ms = Some(ms);
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }
}
