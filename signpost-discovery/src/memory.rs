//! In-memory registry (for testing)

use crate::error::{DiscoveryError, Result};
use crate::registry::{ChangeEvent, RegistryClient, RegistryConnector, WatchStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const EVENT_CAPACITY: usize = 256;

/// In-memory key-value registry with watch support (for testing/development)
#[derive(Clone)]
pub struct InMemoryRegistry {
    values: Arc<RwLock<HashMap<String, String>>>,
    events: broadcast::Sender<ChangeEvent>,
    fetches: Arc<AtomicUsize>,
}

impl InMemoryRegistry {
    /// Create new in-memory registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            events,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set a key and notify watchers
    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.values.write().await.insert(key.clone(), value.clone());
        // No receivers is fine
        let _ = self.events.send(ChangeEvent::put(key, value));
    }

    /// Remove a key and notify watchers
    pub async fn delete(&self, key: &str) {
        if self.values.write().await.remove(key).is_some() {
            let _ = self.events.send(ChangeEvent::delete(key));
        }
    }

    /// Number of open watch streams
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Number of point reads served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn fetch(&self, key: &str) -> Result<Option<String>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream> {
        let key = key.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let matched = match event {
                Ok(event) if event.key == key || (prefix && event.key.starts_with(&key)) => {
                    Some(event)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Watcher on {} lagged behind registry events: {}", key, e);
                    None
                }
            };
            futures::future::ready(matched)
        });

        Ok(stream.boxed())
    }
}

/// Connector handing out a shared [`InMemoryRegistry`]
#[derive(Clone)]
pub struct InMemoryConnector {
    registry: InMemoryRegistry,
}

impl InMemoryConnector {
    /// Connector handing out clones of `registry`
    pub fn new(registry: InMemoryRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RegistryConnector for InMemoryConnector {
    async fn connect(&self, bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>> {
        if bootstrap.is_empty() {
            return Err(DiscoveryError::Connection(
                "no registry endpoints configured".to_string(),
            ));
        }
        Ok(Arc::new(self.registry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EventKind;

    #[tokio::test]
    async fn test_put_and_fetch() {
        let registry = InMemoryRegistry::new();
        registry.put("api", "localhost:8080").await;

        assert_eq!(
            registry.fetch("api").await.unwrap(),
            Some("localhost:8080".to_string())
        );
        assert_eq!(registry.fetch("missing").await.unwrap(), None);
        assert_eq!(registry.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_watch_key() {
        let registry = InMemoryRegistry::new();
        let mut stream = registry.watch("api", false).await.unwrap();

        registry.put("other", "h:1").await;
        registry.put("api", "h:2").await;
        registry.delete("api").await;

        let event = stream.next().await.unwrap();
        assert_eq!(event, ChangeEvent::put("api", "h:2"));

        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "api");
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let registry = InMemoryRegistry::new();
        let mut stream = registry.watch("services/", true).await.unwrap();
        assert_eq!(registry.watcher_count(), 1);

        registry.put("api", "h:1").await;
        registry.put("services/api", "h:2").await;

        let event = stream.next().await.unwrap();
        assert_eq!(event.key, "services/api");
    }

    #[tokio::test]
    async fn test_connector_requires_bootstrap() {
        let connector = InMemoryConnector::new(InMemoryRegistry::new());
        assert!(connector.connect(&[]).await.is_err());
        assert!(connector.connect(&["memory".to_string()]).await.is_ok());
    }
}
