// Signpost - client-side service endpoint resolution
//
// Resolves logical service identifiers to host:port endpoints from an etcd
// registry, with watch-driven caching, round-robin rotation and static
// fallbacks.

// Re-export the resolver crate
pub use signpost_discovery::*;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        DiscoveryError,
        Endpoint,
        EndpointResolver,
        ResolverConfig,
    };
}
