//! Query client that orchestrates caching, deduplication and subscriptions.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{EndpointKind, EndpointRegistry};
use crate::error::QueryError;
use crate::fetch::{Data, FetchError, FetchExecutor, RequestDescriptor};

use super::entry::{QuerySnapshot, QueryStatus};
use super::inflight::{FetchOutcome, InFlightHandle, InFlightRegistry};
use super::key::{compute_key, CacheKey};
use super::middleware::{reduce, LifecycleAction, MutationAction, StoreMiddleware};
use super::store::CacheStore;
use super::subscription::Subscription;

/// Default grace period between the last release and eviction.
pub const DEFAULT_KEEP_UNUSED_FOR: Duration = Duration::from_secs(60);

/// Default age after which cached data is refetched on subscribe.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
  /// Grace period before an unused entry is evicted
  pub keep_unused_for: Duration,
  /// Freshness window for cached data
  pub stale_time: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      keep_unused_for: DEFAULT_KEEP_UNUSED_FOR,
      stale_time: DEFAULT_STALE_TIME,
    }
  }
}

impl CacheConfig {
  pub fn with_keep_unused_for(mut self, keep_unused_for: Duration) -> Self {
    self.keep_unused_for = keep_unused_for;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
  /// Subscribe without fetching; data is loaded on the first `refetch`.
  pub skip: bool,
  /// Refetch periodically while the subscription is alive.
  pub polling_interval: Option<Duration>,
}

impl QueryOptions {
  pub fn skip(mut self) -> Self {
    self.skip = true;
    self
  }

  pub fn with_polling_interval(mut self, interval: Duration) -> Self {
    self.polling_interval = Some(interval);
    self
  }
}

struct PendingEviction {
  timer: u64,
  task: AbortHandle,
}

/// All mutable engine state. Guarded by one lock that is never held across
/// an await.
#[derive(Default)]
struct EngineState {
  store: CacheStore,
  inflight: InFlightRegistry,
  evictions: HashMap<CacheKey, PendingEviction>,
  last_timer: u64,
}

struct Shared {
  registry: Arc<EndpointRegistry>,
  executor: Arc<dyn FetchExecutor>,
  config: CacheConfig,
  middleware: RwLock<Vec<Arc<dyn StoreMiddleware>>>,
  state: Mutex<EngineState>,
  last_subscription: AtomicU64,
  last_mutation: AtomicU64,
}

/// Entry point to the query cache.
///
/// Cheap to clone; all clones share one cache. Operations that start fetches
/// or timers must run inside a Tokio runtime.
#[derive(Clone)]
pub struct QueryClient {
  shared: Arc<Shared>,
}

impl QueryClient {
  pub fn new(
    registry: Arc<EndpointRegistry>,
    executor: Arc<dyn FetchExecutor>,
    config: CacheConfig,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        registry,
        executor,
        config,
        middleware: RwLock::new(Vec::new()),
        state: Mutex::new(EngineState::default()),
        last_subscription: AtomicU64::new(0),
        last_mutation: AtomicU64::new(0),
      }),
    }
  }

  pub fn registry(&self) -> &Arc<EndpointRegistry> {
    &self.shared.registry
  }

  pub fn config(&self) -> CacheConfig {
    self.shared.config
  }

  /// Append a middleware to the dispatch chain.
  pub fn add_middleware(&self, middleware: Arc<dyn StoreMiddleware>) {
    self
      .shared
      .middleware
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(middleware);
  }

  fn lock(&self) -> MutexGuard<'_, EngineState> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn downgrade(&self) -> Weak<Shared> {
    Arc::downgrade(&self.shared)
  }

  fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
    weak.upgrade().map(|shared| Self { shared })
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Subscribe to `endpoint` called with `args`.
  ///
  /// The returned subscription first yields the entry's current state, then
  /// every transition in order. A fetch starts when the entry has never been
  /// loaded, or when this is the only subscriber and the entry failed or is
  /// stale. Key derivation and argument errors are reported here, before any
  /// network activity.
  pub fn subscribe<A>(
    &self,
    endpoint: &str,
    args: &A,
    options: QueryOptions,
  ) -> Result<Subscription, QueryError>
  where
    A: Serialize + ?Sized,
  {
    let definition = self.shared.registry.require(endpoint, EndpointKind::Query)?;
    let key = compute_key(endpoint, args)?;
    let request = definition.build_request(args)?;
    Ok(self.attach(key, request, options))
  }

  fn attach(&self, key: CacheKey, request: RequestDescriptor, options: QueryOptions) -> Subscription {
    let id = self.shared.last_subscription.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, rx) = mpsc::unbounded_channel();

    let mut state = self.lock();
    if let Some(pending) = state.evictions.remove(&key) {
      pending.task.abort();
      debug!(%key, "re-subscribed during grace period, eviction cancelled");
    }

    let in_flight = state.inflight.contains(&key);
    let entry = state.store.ensure(&key, request);
    let first = entry.subscriber_count() == 0;
    let needs_fetch = !options.skip
      && match entry.status() {
        QueryStatus::Idle => true,
        // Loading without a record means `Pending` was dispatched from outside
        QueryStatus::Loading => !in_flight,
        QueryStatus::Success => first && entry.is_stale(self.shared.config.stale_time, Utc::now()),
        QueryStatus::Error => first,
      };

    if needs_fetch {
      self.start_fetch(&mut state, &key);
    }

    if let Some(snapshot) = state.store.snapshot(&key) {
      let _ = tx.send(snapshot);
    }
    let count = state.store.add_subscriber(&key, id, tx);
    trace!(%key, subscription = id, count, "subscribed");
    drop(state);

    let poller = options
      .polling_interval
      .filter(|interval| !interval.is_zero())
      .map(|interval| self.spawn_poller(key.clone(), interval));

    Subscription::new(self.clone(), key, id, rx, poller)
  }

  /// One-shot read: subscribe, wait for the entry to settle, release.
  pub async fn fetch<A>(&self, endpoint: &str, args: &A) -> Result<Data, QueryError>
  where
    A: Serialize + ?Sized,
  {
    let mut subscription = self.subscribe(endpoint, args, QueryOptions::default())?;
    let snapshot = subscription
      .settled()
      .await
      .ok_or(QueryError::Fetch(FetchError::Cancelled))?;

    match snapshot.status {
      QueryStatus::Success => Ok(snapshot.data.unwrap_or(Value::Null)),
      _ => Err(
        snapshot
          .error
          .unwrap_or(FetchError::Cancelled)
          .into(),
      ),
    }
  }

  /// Start a fetch for a cached key, or join the one in flight.
  ///
  /// Returns `None` when the key is not cached.
  pub fn refetch(&self, key: &CacheKey) -> Option<InFlightHandle> {
    let mut state = self.lock();
    self.start_fetch(&mut state, key)
  }

  pub fn snapshot(&self, key: &CacheKey) -> Option<QuerySnapshot> {
    self.lock().store.snapshot(key)
  }

  pub fn cached_keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.lock().store.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self
      .lock()
      .store
      .get(key)
      .map(|entry| entry.subscriber_count())
      .unwrap_or(0)
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    self.lock().inflight.contains(key)
  }

  pub fn is_eviction_pending(&self, key: &CacheKey) -> bool {
    self.lock().evictions.contains_key(key)
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Execute a mutation and invalidate the query endpoints it declares.
  ///
  /// Mutations are neither cached nor deduplicated.
  pub async fn trigger_mutation<A>(&self, endpoint: &str, args: &A) -> Result<Data, QueryError>
  where
    A: Serialize + ?Sized,
  {
    let definition = self
      .shared
      .registry
      .require(endpoint, EndpointKind::Mutation)?;
    let request = definition.build_request(args)?;
    let id = self.shared.last_mutation.fetch_add(1, Ordering::Relaxed) + 1;

    debug!(endpoint, request = id, "triggering mutation");
    self.notify_mutation(MutationAction::Pending {
      endpoint: endpoint.to_string(),
      request: id,
    });

    let data = match self.shared.executor.execute(request).await {
      Ok(data) => data,
      Err(error) => {
        warn!(endpoint, %error, "mutation failed");
        self.notify_mutation(MutationAction::Rejected {
          endpoint: endpoint.to_string(),
          request: id,
          error: error.clone(),
        });
        return Err(error.into());
      }
    };
    self.notify_mutation(MutationAction::Fulfilled {
      endpoint: endpoint.to_string(),
      request: id,
      data: data.clone(),
    });

    let targets = definition.invalidates();
    if !targets.is_empty() {
      let mut state = self.lock();
      self.invalidate_locked(&mut state, targets);
    }

    Ok(data)
  }

  /// Invalidate every cached entry of the given query endpoints.
  ///
  /// Subscribed entries refetch, except ones still idle after a `skip`
  /// subscribe; unsubscribed ones are evicted.
  pub fn invalidate<I, S>(&self, endpoints: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let endpoints: BTreeSet<String> = endpoints.into_iter().map(Into::into).collect();
    let mut state = self.lock();
    self.invalidate_locked(&mut state, &endpoints);
  }

  fn invalidate_locked(&self, state: &mut EngineState, endpoints: &BTreeSet<String>) {
    let keys = state.store.keys_for_endpoints(endpoints);
    info!(endpoints = ?endpoints, entries = keys.len(), "invalidating");

    for key in keys {
      let subscribers = match state.store.get(&key) {
        Some(entry) => entry.subscriber_count(),
        None => continue,
      };

      if subscribers == 0 {
        self.evict_locked(state, &key);
        continue;
      }

      state.store.invalidate(&key);
      // Entries subscribed with `skip` stay idle until the first refetch
      let loaded = state
        .store
        .get(&key)
        .is_some_and(|entry| entry.status() != QueryStatus::Idle);
      if loaded {
        self.start_fetch(state, &key);
      }
    }
  }

  /// Dispatch a lifecycle action through the middleware chain into the store.
  ///
  /// Lets an external container drive transitions; the engine dispatches its
  /// own fetch lifecycle the same way.
  pub fn dispatch(&self, action: LifecycleAction) -> Option<u64> {
    let mut state = self.lock();
    self.dispatch_locked(&mut state, action)
  }

  fn dispatch_locked(&self, state: &mut EngineState, action: LifecycleAction) -> Option<u64> {
    for middleware in self
      .shared
      .middleware
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
    {
      middleware.on_action(&action);
    }
    reduce(&mut state.store, action)
  }

  fn notify_mutation(&self, action: MutationAction) {
    for middleware in self
      .shared
      .middleware
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
    {
      middleware.on_mutation(&action);
    }
  }

  // ==========================================================================
  // Fetch lifecycle
  // ==========================================================================

  fn start_fetch(&self, state: &mut EngineState, key: &CacheKey) -> Option<InFlightHandle> {
    let request = state.store.get(key)?.request().clone();

    let acquired = state.inflight.acquire(key);
    if !acquired.is_new {
      debug!(%key, "deduplicated fetch");
      return Some(acquired.handle);
    }

    let Some(generation) = self.dispatch_locked(state, LifecycleAction::Pending { key: key.clone() })
    else {
      state.inflight.forget(key);
      return None;
    };

    let executor = Arc::clone(&self.shared.executor);
    let weak = self.downgrade();
    let key = key.clone();
    let ticket = acquired.ticket;

    tokio::spawn(async move {
      let outcome = executor.execute(request).await;
      if let Some(client) = Self::upgrade(&weak) {
        client.complete(&key, ticket, generation, outcome);
      }
    });

    Some(acquired.handle)
  }

  fn complete(&self, key: &CacheKey, ticket: u64, generation: u64, outcome: FetchOutcome) {
    let mut state = self.lock();

    // The record goes first so that anything reacting to the transition
    // starts a new fetch instead of joining this one.
    if !state.inflight.release(key, ticket, outcome.clone()) {
      trace!(%key, ticket, "fetch was abandoned");
    }

    let at = Utc::now();
    let action = match outcome {
      Ok(data) => LifecycleAction::Fulfilled {
        key: key.clone(),
        generation,
        data,
        at,
      },
      Err(error) => {
        warn!(%key, %error, "fetch failed");
        LifecycleAction::Rejected {
          key: key.clone(),
          generation,
          error,
          at,
        }
      }
    };

    if self.dispatch_locked(&mut state, action).is_none() {
      return;
    }

    let subscribed = state
      .store
      .get(key)
      .is_some_and(|entry| entry.subscriber_count() > 0);
    if state.store.take_refetch_on_settle(key) && subscribed {
      debug!(%key, "invalidated while loading, refetching");
      self.start_fetch(&mut state, key);
    }
  }

  // ==========================================================================
  // Subscriptions and eviction
  // ==========================================================================

  pub(crate) fn release(&self, key: &CacheKey, subscription: u64) {
    let mut state = self.lock();
    match state.store.remove_subscriber(key, subscription) {
      Some(0) => self.schedule_eviction(&mut state, key),
      Some(count) => trace!(%key, subscription, count, "released"),
      None => {}
    }
  }

  fn schedule_eviction(&self, state: &mut EngineState, key: &CacheKey) {
    let grace = self.shared.config.keep_unused_for;
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(runtime) if !grace.is_zero() => runtime,
      _ => {
        self.evict_locked(state, key);
        return;
      }
    };

    state.last_timer += 1;
    let timer = state.last_timer;
    let weak = self.downgrade();
    let timer_key = key.clone();

    let task = runtime.spawn(async move {
      tokio::time::sleep(grace).await;
      if let Some(client) = Self::upgrade(&weak) {
        client.evict_if_unused(&timer_key, timer);
      }
    });

    let pending = PendingEviction {
      timer,
      task: task.abort_handle(),
    };
    if let Some(previous) = state.evictions.insert(key.clone(), pending) {
      previous.task.abort();
    }
    debug!(%key, ?grace, "last subscriber released, eviction scheduled");
  }

  fn evict_if_unused(&self, key: &CacheKey, timer: u64) {
    let mut state = self.lock();
    match state.evictions.get(key) {
      Some(pending) if pending.timer == timer => {}
      _ => return,
    }
    state.evictions.remove(key);

    let unused = state
      .store
      .get(key)
      .is_some_and(|entry| entry.subscriber_count() == 0);
    if unused {
      self.evict_locked(&mut state, key);
    }
  }

  fn evict_locked(&self, state: &mut EngineState, key: &CacheKey) {
    if let Some(pending) = state.evictions.remove(key) {
      pending.task.abort();
    }
    if state.inflight.forget(key) {
      debug!(%key, "evicting while loading, result will be discarded");
    }
    state.store.evict(key);
  }

  fn spawn_poller(&self, key: CacheKey, interval: Duration) -> AbortHandle {
    let weak = self.downgrade();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(client) = Self::upgrade(&weak) else {
          break;
        };
        trace!(%key, "polling");
        client.refetch(&key);
      }
    })
    .abort_handle()
  }
}
