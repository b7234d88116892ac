//! Endpoint resolver
//!
//! Resolution order for every lookup:
//!
//! 1. Connect to the registry if a bootstrap list is configured and no
//!    connection exists yet. A failure only skips the registry tiers.
//! 2. Serve from the cache, rotating round-robin over the cached set.
//! 3. On a cache miss, open a watch on the id, then fetch it once. A non-empty
//!    result is cached (if the watch has not delivered something newer
//!    meanwhile) and its first endpoint returned.
//! 4. Fall back to the static default, or fail with
//!    [`DiscoveryError::NotFound`].
//!
//! A cached but empty set (the registry holds no usable endpoint, or the key
//! was deleted) goes straight to step 4.

use crate::cache::EndpointCache;
use crate::config::ResolverConfig;
use crate::endpoint::{Endpoint, parse_endpoint_list};
use crate::error::{DiscoveryError, Result};
use crate::etcd::EtcdConnector;
use crate::fallback::StaticFallback;
use crate::monitor::WatchSet;
use crate::registry::{ConnectOutcome, RegistryClient, RegistryConnection, RegistryConnector};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

struct Inner {
    config: ResolverConfig,
    fallback: StaticFallback,
    cache: Arc<EndpointCache>,
    watches: WatchSet,
    connection: RegistryConnection,
    closed: AtomicBool,
}

/// Resolves service identifiers to endpoints.
///
/// Cloning is cheap; clones share the cache, watches and connection.
///
/// # Examples
///
/// ```rust,ignore
/// use signpost_discovery::EndpointResolver;
///
/// let resolver = EndpointResolver::new(vec!["10.0.0.1:2379".to_string()]);
/// resolver.set_default_endpoint("payments", "localhost", "9000").await?;
///
/// let endpoint = resolver.get_endpoint("payments").await?;
/// println!("connecting to {}", endpoint);
/// ```
#[derive(Clone)]
pub struct EndpointResolver {
    inner: Arc<Inner>,
}

impl EndpointResolver {
    /// Resolver backed by etcd; an empty list gives a fallback-only resolver
    pub fn new(registry_endpoints: Vec<String>) -> Self {
        Self::with_connector(
            ResolverConfig::new(registry_endpoints),
            Arc::new(EtcdConnector::new()),
        )
    }

    /// Resolver backed by etcd, with fallbacks seeded from the config
    pub fn from_config(config: ResolverConfig) -> Result<Self> {
        config.validate()?;
        let connector = EtcdConnector::new().with_request_timeout(config.request_timeout());
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    /// Resolver using any registry connector.
    ///
    /// Defaults in `config` that are not `host:port` are skipped; use
    /// [`ResolverConfig::validate`] to reject them up front.
    pub fn with_connector(config: ResolverConfig, connector: Arc<dyn RegistryConnector>) -> Self {
        let fallback = StaticFallback::new();
        for (service_id, raw) in &config.defaults {
            match Endpoint::parse(raw) {
                Some(endpoint) => {
                    let (host, port) = endpoint.into_parts();
                    fallback.set_default(service_id.as_str(), host, port);
                }
                None => warn!("Ignoring malformed default endpoint {} for {}", raw, service_id),
            }
        }

        let cache = Arc::new(EndpointCache::new());
        let connection = RegistryConnection::new(
            config.registry_endpoints.clone(),
            connector,
            config.request_timeout(),
        );

        Self {
            inner: Arc::new(Inner {
                watches: WatchSet::new(Arc::clone(&cache), config.request_timeout()),
                cache,
                fallback,
                connection,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Resolve a service to one endpoint
    pub async fn get_endpoint(&self, service_id: &str) -> Result<Endpoint> {
        let client = self.ensure_connected().await;

        let cached = self.inner.cache.lookup(service_id);
        let len = cached.as_ref().map_or(0, |endpoints| endpoints.len());
        let index = self.inner.cache.next_index(service_id, len);

        match (cached, index) {
            (Some(endpoints), Some(index)) => {
                trace!("Resolved {} from cache (index {})", service_id, index);
                return Ok(endpoints[index].clone());
            }
            (Some(_), None) => {
                debug!("Cached endpoint set for {} is empty", service_id);
                return self.fallback_for(service_id);
            }
            (None, _) => {}
        }

        if let Some(client) = client {
            if let Some(endpoint) = self.resolve_from_registry(service_id, client).await {
                return Ok(endpoint);
            }
        }

        self.fallback_for(service_id)
    }

    /// Set the static default for a service.
    ///
    /// When already connected this also warms the cache and watch for the id.
    pub async fn set_default_endpoint(
        &self,
        service_id: &str,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<()> {
        self.inner.fallback.set_default(service_id, host, port);

        if self.is_connected() {
            // Only the side effects matter here
            let _ = self.get_endpoint(service_id).await;
        }

        Ok(())
    }

    /// Connect to the registry now instead of on the first lookup
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        if self.is_closed() {
            return Err(shut_down());
        }

        let outcome = self.inner.connection.connect().await?;

        // Shut down while the connection was being established
        if self.is_closed() {
            self.inner.connection.close();
            return Err(shut_down());
        }

        if outcome == ConnectOutcome::Connected {
            if let Some(client) = self.inner.connection.client() {
                self.start_initial_watches(client).await;
            }
        }

        Ok(outcome)
    }

    /// Whether a registry connection is currently held
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Number of live watch tasks
    pub fn active_watches(&self) -> usize {
        self.inner.watches.active()
    }

    /// Shared endpoint cache
    pub fn cache(&self) -> &EndpointCache {
        &self.inner.cache
    }

    /// Static default table
    pub fn fallback(&self) -> &StaticFallback {
        &self.inner.fallback
    }

    /// Configuration the resolver was built from
    pub fn config(&self) -> &ResolverConfig {
        &self.inner.config
    }

    /// Stop every watch and drop the registry connection.
    ///
    /// Later lookups are answered from the cache and the fallback table only.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.watches.shutdown().await;
        self.inner.connection.close();
        info!("Endpoint resolver shut down");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn ensure_connected(&self) -> Option<Arc<dyn RegistryClient>> {
        if self.is_closed() || !self.inner.connection.is_enabled() {
            return None;
        }

        if let Some(client) = self.inner.connection.client() {
            return Some(client);
        }

        match self.connect().await {
            Ok(_) => self.inner.connection.client(),
            Err(e) => {
                warn!("Registry unavailable, using fallback endpoints: {}", e);
                None
            }
        }
    }

    /// Watch the configured prefix and every id with a default
    async fn start_initial_watches(&self, client: Arc<dyn RegistryClient>) {
        if let Some(prefix) = &self.inner.config.watch_prefix {
            self.inner.watches.ensure(prefix, true, Arc::clone(&client)).await;
        }

        for service_id in self.inner.fallback.service_ids() {
            self.inner.watches.ensure(&service_id, false, Arc::clone(&client)).await;
        }
    }

    async fn resolve_from_registry(
        &self,
        service_id: &str,
        client: Arc<dyn RegistryClient>,
    ) -> Option<Endpoint> {
        // The watch must be open before the fetch, or a change made between
        // the two would never reach the cache
        self.inner.watches.ensure(service_id, false, Arc::clone(&client)).await;

        let raw = match self.inner.connection.fetch(client.as_ref(), service_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Service {} not present in registry", service_id);
                return None;
            }
            Err(e) => {
                warn!("Registry fetch for {} failed: {}", service_id, e);
                return None;
            }
        };

        let endpoints = parse_endpoint_list(&raw);
        let first = endpoints.first().cloned();

        // A watch event applied while fetching is newer
        self.inner.cache.insert_if_absent(service_id, endpoints);

        if first.is_none() {
            debug!("Registry value {:?} for {} has no usable endpoint", raw, service_id);
        }
        first
    }

    fn fallback_for(&self, service_id: &str) -> Result<Endpoint> {
        self.inner
            .fallback
            .get(service_id)
            .ok_or_else(|| DiscoveryError::NotFound(service_id.to_string()))
    }
}

fn shut_down() -> DiscoveryError {
    DiscoveryError::Connection("resolver is shut down".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryConnector, InMemoryRegistry};
    use crate::registry::WatchStream;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Registry that accepts requests and never answers them
    struct HungRegistry;

    #[async_trait]
    impl RegistryClient for HungRegistry {
        async fn fetch(&self, _key: &str) -> Result<Option<String>> {
            std::future::pending().await
        }

        async fn watch(&self, _key: &str, _prefix: bool) -> Result<WatchStream> {
            Ok(futures::stream::pending().boxed())
        }
    }

    struct HungConnector;

    #[async_trait]
    impl RegistryConnector for HungConnector {
        async fn connect(&self, _bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>> {
            Ok(Arc::new(HungRegistry))
        }
    }

    /// Connects only once the gate is opened
    struct GatedConnector {
        gate: Arc<Notify>,
        registry: InMemoryRegistry,
    }

    #[async_trait]
    impl RegistryConnector for GatedConnector {
        async fn connect(&self, _bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>> {
            self.gate.notified().await;
            Ok(Arc::new(self.registry.clone()))
        }
    }

    fn resolver_with(registry: &InMemoryRegistry) -> EndpointResolver {
        EndpointResolver::with_connector(
            ResolverConfig::new(vec!["memory://local".to_string()]),
            Arc::new(InMemoryConnector::new(registry.clone())),
        )
    }

    #[tokio::test]
    async fn test_fallback_only() {
        let resolver = EndpointResolver::new(Vec::new());
        resolver
            .set_default_endpoint("api", "localhost", "8080")
            .await
            .unwrap();

        let endpoint = resolver.get_endpoint("api").await.unwrap();
        assert_eq!(endpoint, Endpoint::new("localhost", "8080"));
        assert!(!resolver.is_connected());
    }

    #[tokio::test]
    async fn test_not_found() {
        let resolver = EndpointResolver::new(Vec::new());
        let result = resolver.get_endpoint("api").await;
        assert!(matches!(result, Err(DiscoveryError::NotFound(id)) if id == "api"));
    }

    #[tokio::test]
    async fn test_round_robin_from_cache() {
        let registry = InMemoryRegistry::new();
        let resolver = resolver_with(&registry);
        resolver.cache().replace("api", parse_endpoint_list("a:1,b:2,c:3"));

        let mut hosts = Vec::new();
        for _ in 0..3 {
            hosts.push(resolver.get_endpoint("api").await.unwrap().host().to_string());
        }
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fetch_result_is_cached() {
        let registry = InMemoryRegistry::new();
        registry.put("api", "h1:1,h2:2").await;
        let resolver = resolver_with(&registry);

        assert_eq!(resolver.get_endpoint("api").await.unwrap(), Endpoint::new("h1", "1"));
        assert_eq!(registry.fetch_count(), 1);

        // Served from cache; cursor is at 1 after the first lookup
        assert_eq!(resolver.get_endpoint("api").await.unwrap(), Endpoint::new("h2", "2"));
        assert_eq!(registry.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_miss_does_not_duplicate_watch() {
        let registry = InMemoryRegistry::new();
        let resolver = resolver_with(&registry);
        resolver
            .set_default_endpoint("api", "fallback", "80")
            .await
            .unwrap();

        resolver.get_endpoint("api").await.unwrap();
        resolver.get_endpoint("api").await.unwrap();

        assert_eq!(resolver.active_watches(), 1);
        assert_eq!(resolver.cache().cursor("api"), 2);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_registry_value_uses_fallback() {
        let registry = InMemoryRegistry::new();
        registry.put("api", "garbage").await;
        let resolver = resolver_with(&registry);
        resolver
            .set_default_endpoint("api", "fallback", "80")
            .await
            .unwrap();

        assert_eq!(
            resolver.get_endpoint("api").await.unwrap(),
            Endpoint::new("fallback", "80")
        );
        // Empty set is cached, so no second fetch
        resolver.get_endpoint("api").await.unwrap();
        assert_eq!(registry.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_starts_initial_watches() {
        let registry = InMemoryRegistry::new();
        let config = ResolverConfig::new(vec!["memory://local".to_string()])
            .with_watch_prefix("services/")
            .with_default("api", "localhost", "8080")
            .with_default("db", "localhost", "5432");
        let resolver =
            EndpointResolver::with_connector(config, Arc::new(InMemoryConnector::new(registry)));

        assert_eq!(resolver.connect().await.unwrap(), ConnectOutcome::Connected);
        assert_eq!(resolver.active_watches(), 3);
        assert_eq!(
            resolver.connect().await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(resolver.active_watches(), 3);

        resolver.shutdown().await;
        assert_eq!(resolver.active_watches(), 0);
        assert!(!resolver.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_cache_and_fallback() {
        let registry = InMemoryRegistry::new();
        registry.put("api", "h:1").await;
        let resolver = resolver_with(&registry);
        resolver.get_endpoint("api").await.unwrap();

        resolver.shutdown().await;

        assert_eq!(resolver.get_endpoint("api").await.unwrap(), Endpoint::new("h", "1"));
        assert!(!resolver.is_connected());
        assert!(resolver.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_registry_degrades() {
        let config = ResolverConfig::new(vec!["127.0.0.1:1".to_string()])
            .with_request_timeout(Duration::from_millis(200))
            .with_default("api", "localhost", "8080");
        let resolver = EndpointResolver::from_config(config).unwrap();

        assert_eq!(
            resolver.get_endpoint("api").await.unwrap(),
            Endpoint::new("localhost", "8080")
        );
        assert!(!resolver.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out_to_fallback() {
        let config = ResolverConfig::new(vec!["hung:2379".to_string()])
            .with_request_timeout(Duration::from_millis(50))
            .with_default("api", "localhost", "8080");
        let resolver = EndpointResolver::with_connector(config, Arc::new(HungConnector));

        assert_eq!(
            resolver.get_endpoint("api").await.unwrap(),
            Endpoint::new("localhost", "8080")
        );
        assert!(resolver.is_connected());
        assert!(resolver.cache().lookup("api").is_none());

        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_drops_connection() {
        let gate = Arc::new(Notify::new());
        let connector = GatedConnector {
            gate: Arc::clone(&gate),
            registry: InMemoryRegistry::new(),
        };
        let resolver = EndpointResolver::with_connector(
            ResolverConfig::new(vec!["memory://local".to_string()]),
            Arc::new(connector),
        );

        let connecting = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.connect().await }
        });
        tokio::task::yield_now().await;

        resolver.shutdown().await;
        gate.notify_one();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(DiscoveryError::Connection(_))));
        assert!(!resolver.is_connected());
        assert_eq!(resolver.active_watches(), 0);
    }
}
