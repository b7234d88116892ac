//! Watch consumption and watch task tracking

use crate::cache::EndpointCache;
use crate::endpoint::{Endpoint, parse_endpoint_list};
use crate::registry::{ChangeEvent, EventKind, RegistryClient, WatchStream, with_timeout};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Republishes watch events as parsed endpoint lists.
///
/// A put replaces the key's set with the parsed value (possibly empty). A
/// delete replaces it with an empty set.
pub struct ChangeMonitor<F> {
    on_update: F,
    cancel: CancellationToken,
}

impl<F> ChangeMonitor<F>
where
    F: FnMut(String, Vec<Endpoint>) + Send,
{
    /// Monitor calling `on_update` with each changed key and its new set
    pub fn new(on_update: F, cancel: CancellationToken) -> Self {
        Self { on_update, cancel }
    }

    /// Consume the stream until it ends or the monitor is cancelled.
    ///
    /// Returns the number of updates applied.
    pub async fn run<S>(mut self, mut stream: S) -> usize
    where
        S: Stream<Item = ChangeEvent> + Unpin,
    {
        let mut applied = 0;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let endpoints = match event.kind {
                EventKind::Put => parse_endpoint_list(&event.value),
                EventKind::Delete => Vec::new(),
            };
            trace!("Applying {:?} on {} ({} endpoints)", event.kind, event.key, endpoints.len());

            (self.on_update)(event.key, endpoints);
            applied += 1;
        }

        applied
    }
}

/// First delay before reopening a watch whose stream ended
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the reopen delay
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchKey {
    key: String,
    prefix: bool,
}

struct WatchHandle {
    task: JoinHandle<usize>,
}

/// Live watch tasks, at most one per key.
///
/// Every task feeds the shared [`EndpointCache`]. A stream that ends while the
/// set is running is reopened with exponential backoff; for a single key the
/// current value is fetched again after reopening so changes made while no
/// watch was open are not lost. Tasks stop when the set is shut down.
pub struct WatchSet {
    cache: Arc<EndpointCache>,
    handles: DashMap<WatchKey, WatchHandle>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl WatchSet {
    /// Empty set feeding `cache`; `timeout` bounds the fetch made after a reopen
    pub fn new(cache: Arc<EndpointCache>, timeout: Option<Duration>) -> Self {
        Self {
            cache,
            handles: DashMap::new(),
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    /// Start watching `key` unless a live watch already exists.
    ///
    /// The watch stream is open by the time this returns `true`, so any change
    /// made afterwards reaches the cache. Returns `false` if a watch was
    /// already running, the stream could not be opened, or the set is shut
    /// down.
    pub async fn ensure(&self, key: &str, prefix: bool, client: Arc<dyn RegistryClient>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let watch_key = WatchKey {
            key: key.to_string(),
            prefix,
        };

        if self.is_live(&watch_key) {
            trace!("Watch on {} already active", key);
            return false;
        }

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            opened = client.watch(key, prefix) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open watch on {}: {}", key, e);
                return false;
            }
        };

        if self.cancel.is_cancelled() {
            return false;
        }

        match self.handles.entry(watch_key) {
            // A concurrent caller opened the same watch first; drop ours
            Entry::Occupied(entry) if !entry.get().task.is_finished() => false,
            Entry::Occupied(mut entry) => {
                debug!("Restarting watch on {}", key);
                entry.insert(self.spawn(key, prefix, client, stream));
                true
            }
            Entry::Vacant(entry) => {
                debug!("Started watch on {}", key);
                entry.insert(self.spawn(key, prefix, client, stream));
                true
            }
        }
    }

    fn is_live(&self, watch_key: &WatchKey) -> bool {
        self.handles
            .get(watch_key)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    fn spawn(
        &self,
        key: &str,
        prefix: bool,
        client: Arc<dyn RegistryClient>,
        stream: WatchStream,
    ) -> WatchHandle {
        let key = key.to_string();
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.child_token();
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            let mut stream = stream;
            let mut backoff = INITIAL_BACKOFF;
            let mut applied = 0;

            loop {
                let sink = Arc::clone(&cache);
                let monitor = ChangeMonitor::new(
                    move |service_id: String, endpoints: Vec<Endpoint>| sink.replace(service_id, endpoints),
                    cancel.clone(),
                );
                let count = monitor.run(stream).await;
                applied += count;

                if cancel.is_cancelled() {
                    break;
                }
                if count > 0 {
                    backoff = INITIAL_BACKOFF;
                }
                warn!("Watch on {} ended, reopening", key);

                stream = match reopen(client.as_ref(), &key, prefix, &cancel, &mut backoff).await {
                    Some(stream) => stream,
                    None => break,
                };
                if !prefix {
                    resync(client.as_ref(), &key, &cache, timeout).await;
                }
            }

            debug!("Watch on {} stopped after {} updates", key, applied);
            applied
        });

        WatchHandle { task }
    }

    /// Number of watch tasks still running
    pub fn active(&self) -> usize {
        self.handles
            .iter()
            .filter(|entry| !entry.value().task.is_finished())
            .count()
    }

    /// Cancel every watch and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let keys: Vec<WatchKey> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if let Err(e) = handle.task.await {
                    warn!("Watch task for {} panicked: {}", key.key, e);
                }
            }
        }
    }
}

/// Sleep, then try to open the watch again until it opens or `cancel` fires
async fn reopen(
    client: &dyn RegistryClient,
    key: &str,
    prefix: bool,
    cancel: &CancellationToken,
    backoff: &mut Duration,
) -> Option<WatchStream> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(*backoff) => {}
        }
        *backoff = (*backoff * 2).min(MAX_BACKOFF);

        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = client.watch(key, prefix) => opened,
        };
        match opened {
            Ok(stream) => {
                debug!("Reopened watch on {}", key);
                return Some(stream);
            }
            Err(e) => warn!("Failed to reopen watch on {}: {}", key, e),
        }
    }
}

/// Refresh a single key after its watch was reopened.
///
/// The new stream is already open, so events it delivers are applied after
/// this value and win over it.
async fn resync(
    client: &dyn RegistryClient,
    key: &str,
    cache: &EndpointCache,
    timeout: Option<Duration>,
) {
    match with_timeout(timeout, client.fetch(key)).await {
        Ok(Some(raw)) => cache.replace(key, parse_endpoint_list(&raw)),
        Ok(None) => {
            if cache.lookup(key).is_some() {
                cache.replace(key, Vec::new());
            }
        }
        Err(e) => warn!("Failed to refresh {} after reopening its watch: {}", key, e),
    }
}
