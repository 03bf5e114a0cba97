//! Cache entry state and the snapshots published to subscribers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::fetch::{Data, FetchError, RequestDescriptor};

use super::key::CacheKey;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// Referenced but never fetched
  Idle,
  /// A fetch is in flight
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed
  Error,
}

impl QueryStatus {
  /// Whether the last fetch has completed, successfully or not.
  pub fn is_settled(self) -> bool {
    matches!(self, QueryStatus::Success | QueryStatus::Error)
  }
}

/// Point-in-time view of an entry, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
  pub key: CacheKey,
  pub status: QueryStatus,
  /// Last known good data. Kept across refetches and failed refetches.
  pub data: Option<Data>,
  /// Error of the most recent failed fetch, cleared by the next success.
  pub error: Option<FetchError>,
  pub last_updated: Option<DateTime<Utc>>,
  /// Invalidated by a mutation and not yet refreshed
  pub invalidated: bool,
}

impl QuerySnapshot {
  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
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
}

pub(crate) struct Listener {
  pub id: u64,
  pub tx: mpsc::UnboundedSender<QuerySnapshot>,
}

/// Stored lifecycle state and data for one cache key.
pub struct CacheEntry {
  pub(crate) key: CacheKey,
  pub(crate) request: RequestDescriptor,
  pub(crate) status: QueryStatus,
  pub(crate) data: Option<Data>,
  pub(crate) error: Option<FetchError>,
  pub(crate) last_updated: Option<DateTime<Utc>>,
  pub(crate) subscriber_count: usize,
  pub(crate) generation: u64,
  pub(crate) invalidated: bool,
  /// Invalidated while loading; refetch once the current fetch settles
  pub(crate) refetch_on_settle: bool,
  pub(crate) listeners: Vec<Listener>,
}

impl CacheEntry {
  pub(crate) fn new(key: CacheKey, request: RequestDescriptor) -> Self {
    Self {
      key,
      request,
      status: QueryStatus::Idle,
      data: None,
      error: None,
      last_updated: None,
      subscriber_count: 0,
      generation: 0,
      invalidated: false,
      refetch_on_settle: false,
      listeners: Vec::new(),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn endpoint(&self) -> &str {
    self.key.endpoint()
  }

  pub fn request(&self) -> &RequestDescriptor {
    &self.request
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn data(&self) -> Option<&Data> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.error.as_ref()
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.last_updated
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscriber_count
  }

  /// Generation of the most recent fetch started for this entry.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated
  }

  /// Whether the data is older than `stale_time`, or was invalidated.
  pub fn is_stale(&self, stale_time: Duration, now: DateTime<Utc>) -> bool {
    if self.invalidated {
      return true;
    }
    match self.last_updated {
      // A timestamp in the future counts as fresh
      Some(at) => (now - at).to_std().is_ok_and(|age| age > stale_time),
      None => true,
    }
  }

  pub fn snapshot(&self) -> QuerySnapshot {
    QuerySnapshot {
      key: self.key.clone(),
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      last_updated: self.last_updated,
      invalidated: self.invalidated,
    }
  }

  /// Send the current state to every listener.
  ///
  /// Listeners stay registered until their subscription is released, even if
  /// the receiving side has gone away.
  pub(crate) fn publish(&self) {
    if self.listeners.is_empty() {
      return;
    }
    let snapshot = self.snapshot();
    for listener in &self.listeners {
      let _ = listener.tx.send(snapshot.clone());
    }
  }
}

impl std::fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("subscriber_count", &self.subscriber_count)
      .field("generation", &self.generation)
      .field("invalidated", &self.invalidated)
      .finish_non_exhaustive()
  }
}
