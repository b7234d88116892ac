//! Registry client abstraction and connection lifecycle

use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change to a registry key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for puts, empty for deletes
    pub value: String,
}

impl ChangeEvent {
    /// Key was created or overwritten with `value`
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Key was removed
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

/// Unbounded stream of changes; ends when the connection closes
pub type WatchStream = BoxStream<'static, ChangeEvent>;

/// Connected registry client
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Read the current value of a key, `None` if it does not exist
    async fn fetch(&self, key: &str) -> Result<Option<String>>;

    /// Subscribe to changes of a key, or of every key under it if `prefix`
    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream>;
}

/// Establishes registry connections from a bootstrap address list
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    /// Connect to the first reachable address in `bootstrap`
    async fn connect(&self, bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>>;
}

/// Result of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was established
    Connected,
    /// A connection already existed; nothing was done
    AlreadyConnected,
}

/// Owns the single shared registry connection.
///
/// Connect attempts are serialized; a failed attempt leaves the slot empty so
/// the next caller tries again.
pub struct RegistryConnection {
    bootstrap: Vec<String>,
    connector: Arc<dyn RegistryConnector>,
    timeout: Option<Duration>,
    client: RwLock<Option<Arc<dyn RegistryClient>>>,
    connect_lock: Mutex<()>,
}

impl RegistryConnection {
    /// Unconnected holder; `timeout` bounds connect and fetch requests
    pub fn new(
        bootstrap: Vec<String>,
        connector: Arc<dyn RegistryConnector>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            bootstrap,
            connector,
            timeout,
            client: RwLock::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    /// Whether any bootstrap address is configured
    pub fn is_enabled(&self) -> bool {
        !self.bootstrap.is_empty()
    }

    /// Configured bootstrap addresses
    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }

    /// Whether a client is currently held
    pub fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    /// Connected client, if any
    pub fn client(&self) -> Option<Arc<dyn RegistryClient>> {
        self.client.read().clone()
    }

    /// Connect to the registry unless already connected
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        if self.is_connected() {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        if self.bootstrap.is_empty() {
            return Err(DiscoveryError::Connection(
                "no registry endpoints configured".to_string(),
            ));
        }

        debug!("Connecting to registry at {:?}", self.bootstrap);
        let client = with_timeout(self.timeout, self.connector.connect(&self.bootstrap)).await?;
        *self.client.write() = Some(client);
        info!("Connected to registry at {:?}", self.bootstrap);

        Ok(ConnectOutcome::Connected)
    }

    /// Read a key, bounded by the configured timeout
    pub async fn fetch(&self, client: &dyn RegistryClient, key: &str) -> Result<Option<String>> {
        with_timeout(self.timeout, client.fetch(key)).await
    }

    /// Drop the connection
    pub fn close(&self) {
        if self.client.write().take().is_some() {
            info!("Registry connection closed");
        }
    }
}

/// Bound a registry request by an optional timeout
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DiscoveryError::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryConnector, InMemoryRegistry};

    struct HangingConnector;

    #[async_trait]
    impl RegistryConnector for HangingConnector {
        async fn connect(&self, _bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let connection = RegistryConnection::new(
            vec!["memory://local".to_string()],
            Arc::new(InMemoryConnector::new(registry)),
            None,
        );

        assert_eq!(connection.connect().await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(
            connection.connect().await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert!(connection.is_connected());

        connection.close();
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_empty_bootstrap_fails() {
        let connection = RegistryConnection::new(
            Vec::new(),
            Arc::new(InMemoryConnector::new(InMemoryRegistry::new())),
            None,
        );

        assert!(!connection.is_enabled());
        let result = connection.connect().await;
        assert!(matches!(result, Err(DiscoveryError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connection = RegistryConnection::new(
            vec!["hung:2379".to_string()],
            Arc::new(HangingConnector),
            Some(Duration::from_millis(50)),
        );

        let result = connection.connect().await;
        assert!(matches!(result, Err(DiscoveryError::Timeout(_))));
        assert!(!connection.is_connected());
    }
}
