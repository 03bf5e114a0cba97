//! Query cache engine.
//!
//! This module provides the caching core that:
//! - Derives a stable key per endpoint and argument value
//! - Runs at most one fetch per key at a time, sharing its result
//! - Reference-counts subscribers and evicts unused entries after a grace period
//! - Invalidates query entries when a mutation succeeds

mod client;
mod entry;
mod inflight;
mod key;
mod middleware;
mod store;
mod subscription;

pub use client::{
  CacheConfig, QueryClient, QueryOptions, DEFAULT_KEEP_UNUSED_FOR, DEFAULT_STALE_TIME,
};
pub use entry::{CacheEntry, QuerySnapshot, QueryStatus};
pub use inflight::{Acquired, FetchOutcome, InFlightHandle, InFlightRegistry};
pub use key::{canonical_json, compute_key, CacheKey, KeyError, MAX_ARGUMENT_DEPTH};
pub use middleware::{
  reduce, ActionLog, LifecycleAction, MutationAction, StoreMiddleware, TracingMiddleware,
};
pub use store::CacheStore;
pub use subscription::Subscription;
