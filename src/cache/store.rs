//! In-memory cache store.
//!
//! The store is the single owner of every [`CacheEntry`]. Entries change only
//! through the transition functions below, each of which publishes a snapshot
//! to the entry's listeners when it takes effect.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::fetch::{Data, FetchError, RequestDescriptor};

use super::entry::{CacheEntry, Listener, QuerySnapshot, QueryStatus};
use super::key::CacheKey;

#[derive(Debug, Default)]
pub struct CacheStore {
  entries: HashMap<CacheKey, CacheEntry>,
  /// Shared across all entries so a recreated entry never reuses a
  /// generation from its evicted predecessor.
  last_generation: u64,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn snapshot(&self, key: &CacheKey) -> Option<QuerySnapshot> {
    self.entries.get(key).map(CacheEntry::snapshot)
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.entries.keys()
  }

  /// Get the entry for `key`, creating it in `Idle` on first reference.
  pub fn ensure(&mut self, key: &CacheKey, request: RequestDescriptor) -> &mut CacheEntry {
    self.entries.entry(key.clone()).or_insert_with(|| {
      trace!(%key, "created cache entry");
      CacheEntry::new(key.clone(), request)
    })
  }

  /// Move the entry to `Loading` and return the generation of the fetch.
  ///
  /// An entry that is already loading is left untouched and its current
  /// generation returned. Absent entries yield `None`.
  pub fn begin_load(&mut self, key: &CacheKey) -> Option<u64> {
    let entry = self.entries.get_mut(key)?;
    if entry.status == QueryStatus::Loading {
      return Some(entry.generation);
    }

    self.last_generation += 1;
    entry.generation = self.last_generation;
    entry.status = QueryStatus::Loading;
    entry.publish();

    trace!(%key, generation = entry.generation, "loading");
    Some(entry.generation)
  }

  /// Apply a successful result. Returns `false` when the result is stale.
  pub fn settle_success(
    &mut self,
    key: &CacheKey,
    generation: u64,
    data: Data,
    at: DateTime<Utc>,
  ) -> bool {
    let Some(entry) = self.settleable(key, generation) else {
      return false;
    };

    entry.status = QueryStatus::Success;
    entry.data = Some(data);
    entry.error = None;
    entry.last_updated = Some(at);
    entry.invalidated = false;
    entry.publish();

    trace!(%key, generation, "settled with data");
    true
  }

  /// Apply a failed result. Previously fetched data is kept.
  pub fn settle_error(
    &mut self,
    key: &CacheKey,
    generation: u64,
    error: FetchError,
    at: DateTime<Utc>,
  ) -> bool {
    let Some(entry) = self.settleable(key, generation) else {
      return false;
    };

    entry.status = QueryStatus::Error;
    entry.error = Some(error);
    entry.last_updated = Some(at);
    entry.publish();

    trace!(%key, generation, "settled with error");
    true
  }

  /// The entry for `key` if a result of `generation` may still be applied.
  fn settleable(&mut self, key: &CacheKey, generation: u64) -> Option<&mut CacheEntry> {
    match self.entries.get_mut(key) {
      Some(entry) if entry.status == QueryStatus::Loading && entry.generation == generation => {
        Some(entry)
      }
      Some(entry) => {
        debug!(
          %key,
          generation,
          current = entry.generation,
          "discarding result of superseded fetch"
        );
        None
      }
      None => {
        debug!(%key, generation, "discarding result for evicted entry");
        None
      }
    }
  }

  /// Remove the entry. Its listeners are dropped, closing their channels.
  pub fn evict(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    let removed = self.entries.remove(key);
    if removed.is_some() {
      debug!(%key, "evicted cache entry");
    }
    removed
  }

  /// Mark an entry as invalidated.
  ///
  /// Nothing is published; subscribers see the flag with the refetch that
  /// follows. An entry that is loading refetches once its current fetch
  /// settles, since that result may predate the invalidation.
  pub fn invalidate(&mut self, key: &CacheKey) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    entry.invalidated = true;
    if entry.status == QueryStatus::Loading {
      entry.refetch_on_settle = true;
    }
    true
  }

  /// Consume a pending refetch request set by [`CacheStore::invalidate`].
  pub(crate) fn take_refetch_on_settle(&mut self, key: &CacheKey) -> bool {
    match self.entries.get_mut(key) {
      Some(entry) if entry.refetch_on_settle => {
        entry.refetch_on_settle = false;
        entry.invalidated = true;
        true
      }
      _ => false,
    }
  }

  /// Cached keys whose endpoint is one of `endpoints`.
  pub fn keys_for_endpoints(&self, endpoints: &BTreeSet<String>) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self
      .entries
      .keys()
      .filter(|key| endpoints.contains(key.endpoint()))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Register a subscriber with its update channel. Returns the new count.
  pub(crate) fn add_subscriber(
    &mut self,
    key: &CacheKey,
    id: u64,
    tx: mpsc::UnboundedSender<QuerySnapshot>,
  ) -> Option<usize> {
    let entry = self.entries.get_mut(key)?;
    entry.subscriber_count += 1;
    entry.listeners.push(Listener { id, tx });
    Some(entry.subscriber_count)
  }

  /// Remove a subscriber. Returns the remaining count, or `None` when the
  /// subscriber was not registered on this entry.
  pub(crate) fn remove_subscriber(&mut self, key: &CacheKey, id: u64) -> Option<usize> {
    let entry = self.entries.get_mut(key)?;
    let position = entry.listeners.iter().position(|listener| listener.id == id)?;
    entry.listeners.swap_remove(position);
    entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
    Some(entry.subscriber_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::compute_key;
  use serde_json::json;

  fn key(id: u32) -> CacheKey {
    compute_key("getUser", &json!({ "id": id })).unwrap()
  }

  fn store_with(key: &CacheKey) -> CacheStore {
    let mut store = CacheStore::new();
    store.ensure(key, RequestDescriptor::get("users"));
    store
  }

  #[test]
  fn test_new_entry_is_idle() {
    let key = key(1);
    let store = store_with(&key);

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status(), QueryStatus::Idle);
    assert!(entry.data().is_none());
    assert_eq!(entry.subscriber_count(), 0);
  }

  #[test]
  fn test_lifecycle_success() {
    let key = key(1);
    let mut store = store_with(&key);

    let generation = store.begin_load(&key).unwrap();
    assert_eq!(store.get(&key).unwrap().status(), QueryStatus::Loading);

    let now = Utc::now();
    assert!(store.settle_success(&key, generation, json!({"name": "A"}), now));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status(), QueryStatus::Success);
    assert_eq!(entry.data(), Some(&json!({"name": "A"})));
    assert_eq!(entry.last_updated(), Some(now));
  }

  #[test]
  fn test_begin_load_twice_is_noop() {
    let key = key(1);
    let mut store = store_with(&key);

    let first = store.begin_load(&key).unwrap();
    let second = store.begin_load(&key).unwrap();
    assert_eq!(first, second);
    assert_eq!(store.get(&key).unwrap().status(), QueryStatus::Loading);
  }

  #[test]
  fn test_error_keeps_last_good_data() {
    let key = key(1);
    let mut store = store_with(&key);

    let generation = store.begin_load(&key).unwrap();
    store.settle_success(&key, generation, json!("A"), Utc::now());

    let generation = store.begin_load(&key).unwrap();
    let error = FetchError::Transport("connection reset".to_string());
    assert!(store.settle_error(&key, generation, error.clone(), Utc::now()));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status(), QueryStatus::Error);
    assert_eq!(entry.data(), Some(&json!("A")));
    assert_eq!(entry.error(), Some(&error));
  }

  #[test]
  fn test_settle_after_evict_does_not_resurrect() {
    let key = key(1);
    let mut store = store_with(&key);

    let generation = store.begin_load(&key).unwrap();
    store.evict(&key);

    assert!(!store.settle_success(&key, generation, json!("late"), Utc::now()));
    assert!(!store.contains(&key));
  }

  #[test]
  fn test_recreated_entry_rejects_old_generation() {
    let key = key(1);
    let mut store = store_with(&key);

    let old = store.begin_load(&key).unwrap();
    store.evict(&key);

    store.ensure(&key, RequestDescriptor::get("users"));
    let new = store.begin_load(&key).unwrap();
    assert_ne!(old, new);

    assert!(!store.settle_success(&key, old, json!("stale"), Utc::now()));
    assert!(store.settle_success(&key, new, json!("fresh"), Utc::now()));
    assert_eq!(store.get(&key).unwrap().data(), Some(&json!("fresh")));
  }

  #[test]
  fn test_transitions_are_published_in_order() {
    let key = key(1);
    let mut store = store_with(&key);
    let (tx, mut rx) = mpsc::unbounded_channel();
    store.add_subscriber(&key, 1, tx);

    let generation = store.begin_load(&key).unwrap();
    store.settle_success(&key, generation, json!(1), Utc::now());

    assert_eq!(rx.try_recv().unwrap().status, QueryStatus::Loading);
    assert_eq!(rx.try_recv().unwrap().status, QueryStatus::Success);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_remove_subscriber_once() {
    let key = key(1);
    let mut store = store_with(&key);
    let (tx, _rx) = mpsc::unbounded_channel();

    assert_eq!(store.add_subscriber(&key, 1, tx.clone()), Some(1));
    assert_eq!(store.add_subscriber(&key, 2, tx), Some(2));
    assert_eq!(store.remove_subscriber(&key, 1), Some(1));
    assert_eq!(store.remove_subscriber(&key, 2), Some(0));
    assert_eq!(store.remove_subscriber(&key, 2), None);
  }

  #[test]
  fn test_keys_for_endpoints() {
    let mut store = CacheStore::new();
    let user = key(1);
    let post = compute_key("getPost", &json!({"id": 1})).unwrap();
    store.ensure(&user, RequestDescriptor::get("users/1"));
    store.ensure(&post, RequestDescriptor::get("posts/1"));

    let targets = BTreeSet::from(["getUser".to_string()]);
    assert_eq!(store.keys_for_endpoints(&targets), vec![user]);
  }
}
