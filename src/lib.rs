//! Client-side query cache for remote APIs.
//!
//! Endpoints are declared once in an [`EndpointRegistry`]. A [`QueryClient`]
//! derives a stable key per endpoint and argument value, runs at most one
//! fetch per key, shares the result with every subscriber and evicts entries
//! nobody has used for a grace period. Successful mutations invalidate the
//! query endpoints they declare.

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod omdb;
pub mod query;
pub mod telemetry;

pub use cache::{
  CacheConfig, CacheKey, LifecycleAction, QueryClient, QueryOptions, QuerySnapshot, QueryStatus,
  StoreMiddleware, Subscription,
};
pub use endpoint::{EndpointRegistry, MutationEndpoint, QueryEndpoint, RegistryError};
pub use error::QueryError;
pub use fetch::{Data, FetchError, FetchExecutor, FnExecutor, HttpExecutor, Method, RequestDescriptor};
pub use query::{MutationTrigger, UseQuery};
