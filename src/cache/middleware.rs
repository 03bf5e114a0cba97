//! Fetch-lifecycle actions and the middleware seam around the cache store.
//!
//! Every transition the engine makes is expressed as a [`LifecycleAction`].
//! Actions pass through the registered [`StoreMiddleware`]s in order and are
//! then reduced into the [`CacheStore`]. External state containers hook in by
//! registering a middleware that mirrors the actions they care about.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::fetch::{Data, FetchError};

use super::key::CacheKey;
use super::store::CacheStore;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
  /// A fetch is starting for `key`
  Pending { key: CacheKey },
  /// The fetch of `generation` succeeded
  Fulfilled {
    key: CacheKey,
    generation: u64,
    data: Data,
    at: DateTime<Utc>,
  },
  /// The fetch of `generation` failed
  Rejected {
    key: CacheKey,
    generation: u64,
    error: FetchError,
    at: DateTime<Utc>,
  },
}

impl LifecycleAction {
  pub fn key(&self) -> &CacheKey {
    match self {
      LifecycleAction::Pending { key } => key,
      LifecycleAction::Fulfilled { key, .. } => key,
      LifecycleAction::Rejected { key, .. } => key,
    }
  }

  /// Short action type, e.g. `getUser/pending`.
  pub fn action_type(&self) -> String {
    let phase = match self {
      LifecycleAction::Pending { .. } => "pending",
      LifecycleAction::Fulfilled { .. } => "fulfilled",
      LifecycleAction::Rejected { .. } => "rejected",
    };
    format!("{}/{}", self.key().endpoint(), phase)
  }
}

/// Lifecycle of one mutation call. Observed by middleware only; mutations
/// are never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationAction {
  Pending {
    endpoint: String,
    request: u64,
  },
  Fulfilled {
    endpoint: String,
    request: u64,
    data: Data,
  },
  Rejected {
    endpoint: String,
    request: u64,
    error: FetchError,
  },
}

impl MutationAction {
  pub fn endpoint(&self) -> &str {
    match self {
      MutationAction::Pending { endpoint, .. } => endpoint,
      MutationAction::Fulfilled { endpoint, .. } => endpoint,
      MutationAction::Rejected { endpoint, .. } => endpoint,
    }
  }

  /// Client-assigned id shared by the actions of one call.
  pub fn request(&self) -> u64 {
    match self {
      MutationAction::Pending { request, .. } => *request,
      MutationAction::Fulfilled { request, .. } => *request,
      MutationAction::Rejected { request, .. } => *request,
    }
  }

  /// Short action type, e.g. `updateUser/fulfilled`.
  pub fn action_type(&self) -> String {
    let phase = match self {
      MutationAction::Pending { .. } => "pending",
      MutationAction::Fulfilled { .. } => "fulfilled",
      MutationAction::Rejected { .. } => "rejected",
    };
    format!("{}/{}", self.endpoint(), phase)
  }
}

/// Observer of dispatched lifecycle actions.
///
/// `on_action` is called synchronously while the engine state is locked, so
/// implementations must not call back into the `QueryClient`.
pub trait StoreMiddleware: Send + Sync {
  fn on_action(&self, action: &LifecycleAction);

  fn on_mutation(&self, _action: &MutationAction) {}
}

/// Forward an action into the store's transition functions.
///
/// Returns the generation of the started fetch for `Pending`, and for settle
/// actions the generation if the result was applied.
pub fn reduce(store: &mut CacheStore, action: LifecycleAction) -> Option<u64> {
  match action {
    LifecycleAction::Pending { key } => store.begin_load(&key),
    LifecycleAction::Fulfilled {
      key,
      generation,
      data,
      at,
    } => store
      .settle_success(&key, generation, data, at)
      .then_some(generation),
    LifecycleAction::Rejected {
      key,
      generation,
      error,
      at,
    } => store
      .settle_error(&key, generation, error, at)
      .then_some(generation),
  }
}

/// Logs every action at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl StoreMiddleware for TracingMiddleware {
  fn on_action(&self, action: &LifecycleAction) {
    match action {
      LifecycleAction::Rejected { error, .. } => {
        debug!(action = %action.action_type(), key = %action.key(), %error, "dispatch")
      }
      _ => debug!(action = %action.action_type(), key = %action.key(), "dispatch"),
    }
  }

  fn on_mutation(&self, action: &MutationAction) {
    match action {
      MutationAction::Rejected { error, .. } => {
        debug!(action = %action.action_type(), request = action.request(), %error, "mutation")
      }
      _ => debug!(action = %action.action_type(), request = action.request(), "mutation"),
    }
  }
}

/// Records every action it sees, in dispatch order.
#[derive(Debug, Default, Clone)]
pub struct ActionLog {
  actions: Arc<Mutex<Vec<LifecycleAction>>>,
  mutations: Arc<Mutex<Vec<MutationAction>>>,
}

impl ActionLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn actions(&self) -> Vec<LifecycleAction> {
    self
      .actions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn action_types(&self) -> Vec<String> {
    self
      .actions()
      .iter()
      .map(LifecycleAction::action_type)
      .collect()
  }

  pub fn mutations(&self) -> Vec<MutationAction> {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn mutation_types(&self) -> Vec<String> {
    self
      .mutations()
      .iter()
      .map(MutationAction::action_type)
      .collect()
  }
}

impl StoreMiddleware for ActionLog {
  fn on_action(&self, action: &LifecycleAction) {
    self
      .actions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(action.clone());
  }

  fn on_mutation(&self, action: &MutationAction) {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(action.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::entry::QueryStatus;
  use crate::cache::key::compute_key;
  use crate::fetch::RequestDescriptor;
  use serde_json::json;

  #[test]
  fn test_reduce_drives_store_transitions() {
    let key = compute_key("getUser", &json!({"id": 1})).unwrap();
    let mut store = CacheStore::new();
    store.ensure(&key, RequestDescriptor::get("users/1"));

    let generation = reduce(&mut store, LifecycleAction::Pending { key: key.clone() }).unwrap();
    assert_eq!(store.get(&key).unwrap().status(), QueryStatus::Loading);

    let applied = reduce(
      &mut store,
      LifecycleAction::Fulfilled {
        key: key.clone(),
        generation,
        data: json!({"id": 1}),
        at: Utc::now(),
      },
    );
    assert_eq!(applied, Some(generation));
    assert_eq!(store.get(&key).unwrap().status(), QueryStatus::Success);

    let stale = reduce(
      &mut store,
      LifecycleAction::Rejected {
        key: key.clone(),
        generation,
        error: FetchError::Cancelled,
        at: Utc::now(),
      },
    );
    assert_eq!(stale, None);
    assert_eq!(store.get(&key).unwrap().status(), QueryStatus::Success);
  }

  #[test]
  fn test_action_log_records_types() {
    let key = compute_key("getUser", &json!({"id": 1})).unwrap();
    let log = ActionLog::new();
    log.on_action(&LifecycleAction::Pending { key: key.clone() });
    log.on_action(&LifecycleAction::Rejected {
      key,
      generation: 1,
      error: FetchError::Cancelled,
      at: Utc::now(),
    });

    assert_eq!(log.action_types(), vec!["getUser/pending", "getUser/rejected"]);
  }

  #[test]
  fn test_action_log_records_mutations_separately() {
    let log = ActionLog::new();
    log.on_mutation(&MutationAction::Pending {
      endpoint: "updateUser".to_string(),
      request: 3,
    });
    log.on_mutation(&MutationAction::Rejected {
      endpoint: "updateUser".to_string(),
      request: 3,
      error: FetchError::Transport("reset".to_string()),
    });

    assert!(log.actions().is_empty());
    assert_eq!(log.mutation_types(), vec!["updateUser/pending", "updateUser/rejected"]);
    assert!(log.mutations().iter().all(|action| action.request() == 3));
  }
}
