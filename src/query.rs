//! Typed query and mutation handles on top of the cache engine.
//!
//! [`UseQuery<R>`] wraps a [`Subscription`] and decodes the cached JSON into
//! the endpoint's result type. It can be driven either from an event loop tick
//! with [`UseQuery::poll`], or awaited with [`UseQuery::changed`] and
//! [`UseQuery::settled`].
//!
//! # Example
//!
//! ```ignore
//! let mut query = client.use_query(&search_movies, &"alien".to_string(), QueryOptions::default())?;
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_data(query.data()),
//!     QueryStatus::Error => render_error(query.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::cache::{
  CacheKey, InFlightHandle, QueryClient, QueryOptions, QuerySnapshot, QueryStatus, Subscription,
};
use crate::endpoint::{EndpointDefinition, MutationEndpoint, QueryEndpoint, RegistryError};
use crate::error::QueryError;
use crate::fetch::{Data, FetchError};

/// A subscribed, typed view of one cache entry.
///
/// Subscribes on creation and releases when dropped.
pub struct UseQuery<R> {
  endpoint: String,
  subscription: Subscription,
  status: QueryStatus,
  data: Option<R>,
  error: Option<QueryError>,
  last_updated: Option<DateTime<Utc>>,
}

impl<R: DeserializeOwned> UseQuery<R> {
  fn new(endpoint: String, subscription: Subscription) -> Self {
    let mut query = Self {
      endpoint,
      subscription,
      status: QueryStatus::Idle,
      data: None,
      error: None,
      last_updated: None,
    };
    // The current state is queued before the subscription is handed out
    query.poll();
    query
  }

  pub fn key(&self) -> &CacheKey {
    self.subscription.key()
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  /// Last known good data, kept while refetching and after a failed refetch.
  pub fn data(&self) -> Option<&R> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.last_updated
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Refetch now, or join the fetch already in flight.
  pub fn refetch(&self) -> Option<InFlightHandle> {
    self.subscription.refetch()
  }

  /// Apply every queued update without blocking.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Some(snapshot) = self.subscription.try_next() {
      self.apply(snapshot);
      changed = true;
    }
    changed
  }

  /// Wait for the next update. Returns `false` once the subscription is
  /// released.
  pub async fn changed(&mut self) -> bool {
    match self.subscription.next().await {
      Some(snapshot) => {
        self.apply(snapshot);
        true
      }
      None => false,
    }
  }

  /// Wait until the entry has settled and return its result.
  pub async fn settled(&mut self) -> Result<&R, QueryError> {
    self.poll();
    while !self.status.is_settled() {
      if !self.changed().await {
        return Err(QueryError::Fetch(FetchError::Cancelled));
      }
    }

    match (&self.status, &self.data, &self.error) {
      (QueryStatus::Success, Some(data), _) => Ok(data),
      (_, _, Some(error)) => Err(error.clone()),
      _ => Err(self.decode_error("no data")),
    }
  }

  /// Release the subscription early. Dropping the handle does the same.
  pub fn release(&mut self) {
    self.subscription.release();
  }

  fn apply(&mut self, snapshot: QuerySnapshot) {
    self.status = snapshot.status;
    self.last_updated = snapshot.last_updated;
    self.error = snapshot.error.map(QueryError::Fetch);
    self.data = None;

    match snapshot.data.map(decode::<R>) {
      Some(Ok(data)) => self.data = Some(data),
      Some(Err(reason)) => {
        warn!(endpoint = %self.endpoint, %reason, "cached data does not match result type");
        self.status = QueryStatus::Error;
        self.error = Some(self.decode_error(&reason));
      }
      None => {}
    }
  }

  fn decode_error(&self, reason: &str) -> QueryError {
    QueryError::Decode {
      endpoint: self.endpoint.clone(),
      reason: reason.to_string(),
    }
  }
}

impl<R> std::fmt::Debug for UseQuery<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UseQuery")
      .field("endpoint", &self.endpoint)
      .field("key", self.subscription.key())
      .field("status", &self.status)
      .field("last_updated", &self.last_updated)
      .finish_non_exhaustive()
  }
}

fn decode<R: DeserializeOwned>(data: Data) -> Result<R, String> {
  serde_json::from_value(data).map_err(|e| e.to_string())
}

/// Trigger for one mutation endpoint.
pub struct MutationTrigger<A, R> {
  client: QueryClient,
  endpoint: String,
  _types: PhantomData<fn(A) -> R>,
}

impl<A, R> MutationTrigger<A, R>
where
  A: Serialize,
  R: DeserializeOwned,
{
  /// Run the mutation, then invalidate the queries it declares.
  pub async fn trigger(&self, args: &A) -> Result<R, QueryError> {
    let data = self.client.trigger_mutation(&self.endpoint, args).await?;
    serde_json::from_value(data).map_err(|e| QueryError::Decode {
      endpoint: self.endpoint.clone(),
      reason: e.to_string(),
    })
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

impl<A, R> Clone for MutationTrigger<A, R> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      endpoint: self.endpoint.clone(),
      _types: PhantomData,
    }
  }
}

impl QueryClient {
  /// Register a batch of endpoints after startup.
  pub fn inject_endpoints<I>(&self, definitions: I) -> Result<(), RegistryError>
  where
    I: IntoIterator<Item = Arc<EndpointDefinition>>,
  {
    self.registry().inject(definitions)
  }

  /// Subscribe to a typed query endpoint.
  pub fn use_query<A, R>(
    &self,
    endpoint: &QueryEndpoint<A, R>,
    args: &A,
    options: QueryOptions,
  ) -> Result<UseQuery<R>, QueryError>
  where
    A: Serialize,
    R: DeserializeOwned,
  {
    self.check_registered(&endpoint.definition())?;
    let subscription = self.subscribe(endpoint.id(), args, options)?;
    Ok(UseQuery::new(endpoint.id().to_string(), subscription))
  }

  /// Typed trigger for a mutation endpoint.
  pub fn use_mutation<A, R>(
    &self,
    endpoint: &MutationEndpoint<A, R>,
  ) -> Result<MutationTrigger<A, R>, QueryError> {
    self.check_registered(&endpoint.definition())?;
    Ok(MutationTrigger {
      client: self.clone(),
      endpoint: endpoint.id().to_string(),
      _types: PhantomData,
    })
  }

  /// The handle must describe the endpoint that is actually registered.
  fn check_registered(&self, definition: &EndpointDefinition) -> Result<(), RegistryError> {
    let registered = self
      .registry()
      .require(definition.id(), definition.kind())?;

    if registered.shape() != definition.shape() {
      return Err(RegistryError::DuplicateEndpoint {
        id: definition.id().to_string(),
        existing: registered.shape().to_string(),
        requested: definition.shape().to_string(),
      });
    }
    Ok(())
  }
}
