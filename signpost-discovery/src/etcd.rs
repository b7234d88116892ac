//! etcd registry client over the v3 JSON gateway

use crate::error::{DiscoveryError, Result};
use crate::registry::{ChangeEvent, RegistryClient, RegistryConnector, WatchStream};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the first reachable etcd member of a bootstrap list
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    request_timeout: Option<Duration>,
}

impl EtcdConnector {
    /// Connector without a request timeout
    pub fn new() -> Self {
        Self {
            request_timeout: None,
        }
    }

    /// Bound point requests (`/version`, `/v3/kv/range`); watches are not bounded
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for EtcdConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryConnector for EtcdConnector {
    async fn connect(&self, bootstrap: &[String]) -> Result<Arc<dyn RegistryClient>> {
        if bootstrap.is_empty() {
            return Err(DiscoveryError::Connection(
                "no registry endpoints configured".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(self.request_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .build()
            .map_err(|e| DiscoveryError::Connection(e.to_string()))?;

        let mut last_error = None;
        for address in bootstrap {
            let base_url = match normalize_address(address) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping invalid etcd address {}: {}", address, e);
                    last_error = Some(e);
                    continue;
                }
            };

            let registry = EtcdRegistry {
                base_url,
                client: client.clone(),
                request_timeout: self.request_timeout,
            };

            match registry.ping().await {
                Ok(()) => {
                    info!("Connected to etcd at {}", registry.base_url);
                    return Ok(Arc::new(registry));
                }
                Err(e) => {
                    debug!("etcd member {} unreachable: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        Err(DiscoveryError::Connection(match last_error {
            Some(e) => e.to_string(),
            None => "no reachable etcd member".to_string(),
        }))
    }
}

/// Registry client backed by one etcd member
pub struct EtcdRegistry {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Option<Duration>,
}

impl EtcdRegistry {
    /// Create a client for one member without probing it
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use signpost_discovery::EtcdRegistry;
    ///
    /// let etcd = EtcdRegistry::new("localhost:2379")?;
    /// let value = etcd.fetch("payments").await?;
    /// ```
    pub fn new(address: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_address(address)?,
            client: reqwest::Client::new(),
            request_timeout: None,
        })
    }

    /// Normalized member URL, without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{}", self.base_url, path))
    }

    fn bounded(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.request_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    async fn ping(&self) -> Result<()> {
        let request = self.client.get(format!("{}/version", self.base_url));
        let response = self.bounded(request).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DiscoveryError::Connection(format!(
                "{} answered {}",
                self.base_url,
                response.status()
            )))
        }
    }
}

#[derive(Deserialize)]
struct RangeResponse {
    kvs: Option<Vec<EtcdKv>>,
}

#[derive(Deserialize)]
struct EtcdKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[async_trait]
impl RegistryClient for EtcdRegistry {
    async fn fetch(&self, key: &str) -> Result<Option<String>> {
        let payload = serde_json::json!({
            "key": general_purpose::STANDARD.encode(key.as_bytes()),
        });

        let response = self.bounded(self.post("/v3/kv/range")).json(&payload).send().await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Fetch(format!(
                "range request for {} answered {}",
                key,
                response.status()
            )));
        }

        let range: RangeResponse = response.json().await?;

        for kv in range.kvs.unwrap_or_default() {
            if decode(&kv.key)? == key {
                debug!("Fetched {} from etcd", key);
                return decode(&kv.value).map(Some);
            }
        }

        Ok(None)
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream> {
        let mut create = serde_json::json!({
            "key": general_purpose::STANDARD.encode(key.as_bytes()),
        });
        if prefix {
            create["range_end"] =
                serde_json::Value::String(general_purpose::STANDARD.encode(prefix_range_end(key.as_bytes())));
        }
        let payload = serde_json::json!({ "create_request": create });

        let response = self.post("/v3/watch").json(&payload).send().await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Watch(format!(
                "watch request for {} answered {}",
                key,
                response.status()
            )));
        }

        debug!("Opened etcd watch on {} (prefix: {})", key, prefix);

        let key = key.to_string();
        let body = response.bytes_stream().boxed();
        let state = (body, WatchDecoder::new(), VecDeque::new());

        let stream = futures::stream::unfold(state, move |(mut body, mut decoder, mut pending)| {
            let key = key.clone();
            async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (body, decoder, pending)));
                    }

                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            warn!("etcd watch stream for {} failed: {}", key, e);
                            return None;
                        }
                        None => {
                            debug!("etcd watch stream for {} closed", key);
                            return None;
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Incremental decoder for the newline-delimited JSON watch response
#[derive(Debug, Default)]
pub struct WatchDecoder {
    buffer: Vec<u8>,
}

#[derive(Deserialize)]
struct WatchFrame {
    result: Option<WatchResult>,
}

#[derive(Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: Option<EtcdKv>,
}

impl WatchDecoder {
    /// Decoder with an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ChangeEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<WatchFrame>(line) {
                Ok(frame) => events.extend(frame.result.into_iter().flat_map(|r| r.events).filter_map(convert_event)),
                Err(e) => debug!("Skipping undecodable watch frame: {}", e),
            }
        }

        events
    }
}

fn convert_event(raw: RawEvent) -> Option<ChangeEvent> {
    let kv = raw.kv?;
    let key = decode(&kv.key).ok()?;

    // The gateway omits the type for PUT, the zero enum value
    match raw.kind.as_deref() {
        Some("DELETE") => Some(ChangeEvent::delete(key)),
        _ => Some(ChangeEvent::put(key, decode(&kv.value).ok()?)),
    }
}

fn decode(encoded: &str) -> Result<String> {
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| DiscoveryError::Fetch(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| DiscoveryError::Fetch(e.to_string()))
}

/// Range end covering every key that starts with `prefix`
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All bytes were 0xff: watch to the end of the keyspace
    vec![0]
}

fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| DiscoveryError::InvalidConfiguration(format!("{}: {}", address, e)))?;

    Ok(url.as_str().trim_end_matches('/').to_string())
}
