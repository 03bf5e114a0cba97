//! Registry of outstanding fetches, at most one per cache key.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::trace;

use crate::fetch::{Data, FetchError};

use super::key::CacheKey;

pub type FetchOutcome = Result<Data, FetchError>;

struct InFlightRecord {
  ticket: u64,
  tx: watch::Sender<Option<FetchOutcome>>,
}

/// Awaitable result of an in-flight fetch. Every clone observes the same
/// outcome.
#[derive(Clone)]
pub struct InFlightHandle {
  rx: watch::Receiver<Option<FetchOutcome>>,
}

impl InFlightHandle {
  /// Wait for the fetch to settle.
  ///
  /// Resolves to [`FetchError::Cancelled`] if the record was dropped without
  /// a result, e.g. because the entry was evicted.
  pub async fn wait(mut self) -> FetchOutcome {
    loop {
      if let Some(outcome) = self.rx.borrow_and_update().as_ref() {
        return outcome.clone();
      }
      if self.rx.changed().await.is_err() {
        return self
          .rx
          .borrow()
          .clone()
          .unwrap_or(Err(FetchError::Cancelled));
      }
    }
  }
}

impl std::fmt::Debug for InFlightHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InFlightHandle")
      .field("settled", &self.rx.borrow().is_some())
      .finish()
  }
}

/// Result of [`InFlightRegistry::acquire`].
pub struct Acquired {
  /// The caller created the record and must start the fetch, then call
  /// [`InFlightRegistry::release`] with `ticket`.
  pub is_new: bool,
  pub ticket: u64,
  pub handle: InFlightHandle,
}

#[derive(Default)]
pub struct InFlightRegistry {
  records: HashMap<CacheKey, InFlightRecord>,
  last_ticket: u64,
}

impl InFlightRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the fetch for `key`, creating a record if none exists.
  pub fn acquire(&mut self, key: &CacheKey) -> Acquired {
    if let Some(record) = self.records.get(key) {
      trace!(%key, ticket = record.ticket, "joining in-flight fetch");
      return Acquired {
        is_new: false,
        ticket: record.ticket,
        handle: InFlightHandle {
          rx: record.tx.subscribe(),
        },
      };
    }

    self.last_ticket += 1;
    let ticket = self.last_ticket;
    let (tx, rx) = watch::channel(None);
    self.records.insert(key.clone(), InFlightRecord { ticket, tx });

    Acquired {
      is_new: true,
      ticket,
      handle: InFlightHandle { rx },
    }
  }

  /// Remove the record for `key` and hand `outcome` to every waiter.
  ///
  /// Returns `false` when the record was already dropped or belongs to a
  /// newer fetch; the outcome then reaches no one.
  pub fn release(&mut self, key: &CacheKey, ticket: u64, outcome: FetchOutcome) -> bool {
    match self.records.get(key) {
      Some(record) if record.ticket == ticket => {}
      _ => return false,
    }

    if let Some(record) = self.records.remove(key) {
      // No waiters is fine
      let _ = record.tx.send(Some(outcome));
    }
    true
  }

  /// Drop the record for `key` without a result.
  pub fn forget(&mut self, key: &CacheKey) -> bool {
    self.records.remove(key).is_some()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.records.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::compute_key;
  use serde_json::json;

  fn key() -> CacheKey {
    compute_key("getUser", &json!({"id": 1})).unwrap()
  }

  #[test]
  fn test_second_acquire_joins() {
    let mut registry = InFlightRegistry::new();
    let key = key();

    let first = registry.acquire(&key);
    let second = registry.acquire(&key);

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.ticket, second.ticket);
    assert_eq!(registry.len(), 1);
  }

  #[tokio::test]
  async fn test_release_reaches_all_waiters() {
    let mut registry = InFlightRegistry::new();
    let key = key();

    let first = registry.acquire(&key);
    let second = registry.acquire(&key);

    assert!(registry.release(&key, first.ticket, Ok(json!("A"))));
    assert!(!registry.contains(&key));

    assert_eq!(first.handle.wait().await, Ok(json!("A")));
    assert_eq!(second.handle.wait().await, Ok(json!("A")));
  }

  #[tokio::test]
  async fn test_release_after_failure_removes_record() {
    let mut registry = InFlightRegistry::new();
    let key = key();

    let acquired = registry.acquire(&key);
    let error = FetchError::Transport("timeout".to_string());
    assert!(registry.release(&key, acquired.ticket, Err(error.clone())));

    assert!(registry.is_empty());
    assert_eq!(acquired.handle.wait().await, Err(error));
    assert!(registry.acquire(&key).is_new);
  }

  #[tokio::test]
  async fn test_forget_cancels_waiters() {
    let mut registry = InFlightRegistry::new();
    let key = key();

    let acquired = registry.acquire(&key);
    assert!(registry.forget(&key));
    assert!(!registry.release(&key, acquired.ticket, Ok(json!("late"))));

    assert_eq!(acquired.handle.wait().await, Err(FetchError::Cancelled));
  }

  #[test]
  fn test_stale_ticket_does_not_release_newer_record() {
    let mut registry = InFlightRegistry::new();
    let key = key();

    let old = registry.acquire(&key);
    registry.forget(&key);
    let new = registry.acquire(&key);

    assert!(!registry.release(&key, old.ticket, Ok(json!("old"))));
    assert!(registry.contains(&key));
    assert!(registry.release(&key, new.ticket, Ok(json!("new"))));
  }
}
