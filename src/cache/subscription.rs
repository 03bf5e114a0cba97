//! Subscription handles held by cache consumers.

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::client::QueryClient;
use super::entry::QuerySnapshot;
use super::inflight::InFlightHandle;
use super::key::CacheKey;

/// A live interest in one cache key.
///
/// Keeps the entry from being evicted and receives its state transitions in
/// order. Dropping the handle releases it.
pub struct Subscription {
  client: QueryClient,
  key: CacheKey,
  id: u64,
  updates: mpsc::UnboundedReceiver<QuerySnapshot>,
  poller: Option<AbortHandle>,
  released: bool,
}

impl Subscription {
  pub(crate) fn new(
    client: QueryClient,
    key: CacheKey,
    id: u64,
    updates: mpsc::UnboundedReceiver<QuerySnapshot>,
    poller: Option<AbortHandle>,
  ) -> Self {
    Self {
      client,
      key,
      id,
      updates,
      poller,
      released: false,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Current state of the entry, independent of queued updates.
  pub fn snapshot(&self) -> Option<QuerySnapshot> {
    self.client.snapshot(&self.key)
  }

  /// Next state transition. `None` once released.
  pub async fn next(&mut self) -> Option<QuerySnapshot> {
    if self.released {
      return None;
    }
    self.updates.recv().await
  }

  /// Next queued transition, without waiting.
  pub fn try_next(&mut self) -> Option<QuerySnapshot> {
    if self.released {
      return None;
    }
    self.updates.try_recv().ok()
  }

  /// Wait for the next transition that leaves the entry settled.
  pub async fn settled(&mut self) -> Option<QuerySnapshot> {
    loop {
      let snapshot = self.next().await?;
      if snapshot.status.is_settled() {
        return Some(snapshot);
      }
    }
  }

  /// Refetch the entry, or join the fetch already in flight.
  pub fn refetch(&self) -> Option<InFlightHandle> {
    if self.released {
      return None;
    }
    self.client.refetch(&self.key)
  }

  /// Drop this subscriber's interest. Only the first call has an effect.
  pub fn release(&mut self) {
    if self.released {
      return;
    }
    self.released = true;

    if let Some(poller) = self.poller.take() {
      poller.abort();
    }
    self.client.release(&self.key, self.id);
  }

  pub fn is_released(&self) -> bool {
    self.released
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("released", &self.released)
      .finish_non_exhaustive()
  }
}
