//! Route registry and endpoint selection for the routeway data-plane
//!
//! Maps hostnames and paths to pools of backend endpoints. Lookups use a
//! trie keyed by reversed host labels and then path segments, returning the
//! pool of the longest matching route. Wildcard hosts (`*.example.com`)
//! are consulted when no exact host matches.

pub mod endpoint;
pub mod iterator;
pub mod pool;
pub mod registry;
pub mod route_key;
mod trie;
pub mod wildcard;

pub use endpoint::{Endpoint, ModificationTag, TagOrdering};
pub use iterator::{EndpointIterator, LoadBalance, PoolIterator};
pub use pool::{EndpointView, PoolPut, RoutePool};
pub use registry::{PruneOutcome, RegistryConfig, RouteRegistry, SuspendPruning};
pub use route_key::RouteKey;
pub use wildcard::{extract_parent_wildcard, WildcardError, WildcardPattern};

use thiserror::Error;

/// Router errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid route key: {0:?}")]
    InvalidRouteKey(String),

    #[error("Invalid wildcard pattern: {0}")]
    InvalidWildcardPattern(#[from] WildcardError),
}
