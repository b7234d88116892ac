//! Static fallback endpoints

use crate::endpoint::Endpoint;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Explicitly configured default endpoint per service.
///
/// Answers lookups without any I/O and survives registry outages.
#[derive(Debug, Default)]
pub struct StaticFallback {
    defaults: RwLock<HashMap<String, Endpoint>>,
}

impl StaticFallback {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite the default endpoint for a service
    pub fn set_default(
        &self,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: impl Into<String>,
    ) {
        self.defaults
            .write()
            .insert(service_id.into(), Endpoint::new(host, port));
    }

    /// Default endpoint for a service, if one was set
    pub fn get(&self, service_id: &str) -> Option<Endpoint> {
        self.defaults.read().get(service_id).cloned()
    }

    /// Services that have a default, sorted
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.defaults.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of services with a default
    pub fn len(&self) -> usize {
        self.defaults.read().len()
    }

    /// Check if no default is set
    pub fn is_empty(&self) -> bool {
        self.defaults.read().is_empty()
    }
}
