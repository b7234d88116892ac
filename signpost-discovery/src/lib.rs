//! Service endpoint resolution for Signpost
//!
//! Resolves a logical service identifier to a `host:port` endpoint using a
//! dynamic registry (etcd) with local caching, round-robin distribution and a
//! static fallback table.
//!
//! ## Features
//!
//! - **Registry lookups** - One-shot fetch on a cache miss
//! - **Watches** - Registry changes are pushed into the cache, one watch per key
//! - **Load Balancing** - Round-robin over the cached endpoints of a service
//! - **Fallback** - Static defaults when the registry is down or has no entry
//! - **Multiple Backends** - etcd, or in-memory for tests
//!
//! ## Quick Start
//!
//! ### Fallback Only
//!
//! ```rust
//! use signpost_discovery::EndpointResolver;
//!
//! # tokio_test::block_on(async {
//! let resolver = EndpointResolver::new(Vec::new());
//! resolver.set_default_endpoint("api", "localhost", "8080").await.unwrap();
//!
//! let endpoint = resolver.get_endpoint("api").await.unwrap();
//! assert_eq!(endpoint.to_string(), "localhost:8080");
//! # });
//! ```
//!
//! ### etcd
//!
//! ```rust,ignore
//! use signpost_discovery::*;
//!
//! let config = ResolverConfig::from_file("signpost.toml")?;
//! let resolver = EndpointResolver::from_config(config)?;
//!
//! let endpoint = resolver.get_endpoint("payments").await?;
//! ```
//!
//! The registry value for a service key is a comma-separated list of
//! `host:port` tokens, e.g. `10.0.0.1:8080, 10.0.0.2:8081`.

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod etcd;
pub mod fallback;
pub mod logging;
pub mod memory;
pub mod monitor;
pub mod registry;
pub mod resolver;

pub use cache::EndpointCache;
pub use config::ResolverConfig;
pub use endpoint::{Endpoint, parse_endpoint_list};
pub use error::{DiscoveryError, Result};
pub use etcd::{EtcdConnector, EtcdRegistry, WatchDecoder};
pub use fallback::StaticFallback;
pub use memory::{InMemoryConnector, InMemoryRegistry};
pub use monitor::{ChangeMonitor, WatchSet};
pub use registry::{
    ChangeEvent, ConnectOutcome, EventKind, RegistryClient, RegistryConnection, RegistryConnector,
    WatchStream,
};
pub use resolver::EndpointResolver;
