//! Endpoint cache and round-robin cursors
//!
//! Uses DashMap so that every operation is atomic per service without any
//! cross-service locking.

use crate::endpoint::Endpoint;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Cached endpoint sets keyed by service identifier
#[derive(Debug, Default)]
pub struct EndpointCache {
    /// Endpoint sets, replaced wholesale on every update
    endpoints: DashMap<String, Arc<[Endpoint]>>,
    /// Rotation cursors
    cursors: DashMap<String, usize>,
}

impl EndpointCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current endpoint set, or `None` if the service was never resolved
    pub fn lookup(&self, service_id: &str) -> Option<Arc<[Endpoint]>> {
        self.endpoints
            .get(service_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Atomically overwrite the endpoint set for a service
    pub fn replace(&self, service_id: impl Into<String>, endpoints: Vec<Endpoint>) {
        let service_id = service_id.into();
        trace!("Replacing endpoint set for {} ({} endpoints)", service_id, endpoints.len());
        self.endpoints.insert(service_id, endpoints.into());
    }

    /// Store the endpoint set only if nothing is cached yet.
    ///
    /// Returns `true` if the set was stored.
    pub fn insert_if_absent(&self, service_id: impl Into<String>, endpoints: Vec<Endpoint>) -> bool {
        let mut inserted = false;
        self.endpoints.entry(service_id.into()).or_insert_with(|| {
            inserted = true;
            endpoints.into()
        });
        inserted
    }

    /// Advance the rotation cursor and pick an index into a set of `len`.
    ///
    /// The cursor advances on every call, including when `len` is zero, in
    /// which case `None` is returned and the caller must use another tier.
    pub fn next_index(&self, service_id: &str, len: usize) -> Option<usize> {
        let rotated = {
            let mut cursor = self.cursors.entry(service_id.to_string()).or_insert(0);
            let rotated = *cursor;
            *cursor = rotated.wrapping_add(1);
            rotated
        };

        (len > 0).then(|| rotated % len)
    }

    /// Current cursor value for a service (0 if never looked up)
    pub fn cursor(&self, service_id: &str) -> usize {
        self.cursors.get(service_id).map(|c| *c).unwrap_or(0)
    }

    /// Number of cached endpoint sets
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Check if no endpoint set is cached
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| Endpoint::new(format!("10.0.0.{}", i), "80"))
            .collect()
    }

    #[test]
    fn test_lookup_absent() {
        let cache = EndpointCache::new();
        assert!(cache.lookup("api").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_is_wholesale() {
        let cache = EndpointCache::new();
        cache.replace("api", endpoints(3));
        cache.replace("api", endpoints(1));

        assert_eq!(cache.lookup("api").unwrap().len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_if_absent() {
        let cache = EndpointCache::new();
        assert!(cache.insert_if_absent("api", endpoints(2)));
        assert!(!cache.insert_if_absent("api", endpoints(5)));
        assert_eq!(cache.lookup("api").unwrap().len(), 2);
    }

    #[test]
    fn test_round_robin_visits_each_index() {
        let cache = EndpointCache::new();
        let picked: Vec<usize> = (0..6).map(|_| cache.next_index("api", 3).unwrap()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_cursor_advances_on_miss() {
        let cache = EndpointCache::new();
        assert_eq!(cache.next_index("api", 0), None);
        assert_eq!(cache.next_index("api", 0), None);
        assert_eq!(cache.cursor("api"), 2);

        // Third lookup starts from the advanced cursor
        assert_eq!(cache.next_index("api", 2), Some(0));
        assert_eq!(cache.next_index("api", 2), Some(1));
    }

    #[test]
    fn test_cursors_are_per_service() {
        let cache = EndpointCache::new();
        cache.next_index("a", 4);
        cache.next_index("a", 4);

        assert_eq!(cache.next_index("b", 4), Some(0));
        assert_eq!(cache.cursor("a"), 2);
    }

    #[test]
    fn test_concurrent_cursor_increments() {
        let cache = Arc::new(EndpointCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        cache.next_index("api", 3);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.cursor("api"), 8000);
    }
}
