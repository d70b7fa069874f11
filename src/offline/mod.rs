//! Offline-aware data access with policy-governed caching.
//!
//! `OfflineData<T>` wraps a fetch function and a cache context
//! (category, role, user). It serves the freshest data the category's policy
//! permits: fresh cache, a network fetch, or stale cache while offline.
//!
//! Like a poll-driven query, fetches run on spawned tasks and their results
//! are applied by the owner:
//!
//! ```ignore
//! let mut reservations = OfflineData::new(
//!     move || {
//!         let remote = remote.clone();
//!         async move { remote.fetch_json().await }
//!     },
//!     CacheContext::new("user_reservations", Role::Associado).with_user("123"),
//!     deps,
//! );
//!
//! // In event loop tick
//! if reservations.poll() {
//!     // Result changed, trigger re-render
//! }
//!
//! // In render
//! let result = reservations.result();
//! if result.is_loading { /* spinner */ }
//! ```
//!
//! Every load gets a new generation number. Task results carry the
//! generation they were started under and are dropped if it is no longer
//! current, so a slow fetch never overwrites data from a newer load or a
//! different user. Storage writes happen only when a result is applied.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::{
  read_entry, write_entry, CacheEntry, CachePolicy, KeyValueStore, PolicyRegistry, Role,
};
use crate::clock::{Clock, SystemClock};
use crate::error::AccessError;
use crate::network::{AssumeOnline, NetworkStatus};


/// Who is asking for which category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContext {
  pub category: String,
  pub role: Role,
  pub user_id: Option<String>,
}

impl CacheContext {
  pub fn new(category: impl Into<String>, role: Role) -> Self {
    Self {
      category: category.into(),
      role,
      user_id: None,
    }
  }

  pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }

  pub fn cache_key(&self) -> String {
    PolicyRegistry::build_cache_key(&self.category, self.user_id.as_deref())
  }
}

/// Where the displayed data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fetched during this subscription
  Network,
  /// Cached and younger than the policy's max age
  CacheFresh,
  /// Cached and past max age, served because the policy allows it
  CacheStale,
}

/// Snapshot of a subscription's state, for rendering.
#[derive(Debug, Clone)]
pub struct AccessResult<T> {
  /// Last payload obtained, from the network or the cache
  pub data: Option<T>,
  /// True only while a blocking load is in flight
  pub is_loading: bool,
  /// Set only when no usable data could be produced
  pub error: Option<AccessError>,
  pub is_offline: bool,
  pub is_stale: bool,
  /// When `data` was written to the cache (or fetched, for network-only data)
  pub last_updated: Option<DateTime<Utc>>,
  pub source: Option<DataSource>,
}

impl<T> AccessResult<T> {
  fn empty(is_offline: bool) -> Self {
    Self {
      data: None,
      is_loading: false,
      error: None,
      is_offline,
      is_stale: false,
      last_updated: None,
      source: None,
    }
  }

  pub fn last_updated_label(&self) -> Option<String> {
    self
      .last_updated
      .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
  }
}

/// Shared collaborators of every subscription.
#[derive(Clone)]
pub struct CacheDeps {
  pub registry: Arc<PolicyRegistry>,
  pub storage: Arc<dyn KeyValueStore>,
  pub network: Arc<dyn NetworkStatus>,
  pub clock: Arc<dyn Clock>,
}

impl CacheDeps {
  /// Wall clock and no connectivity source (assume online).
  pub fn new(registry: Arc<PolicyRegistry>, storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      registry,
      storage,
      network: Arc::new(AssumeOnline),
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_network(mut self, network: Arc<dyn NetworkStatus>) -> Self {
    self.network = network;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A finished fetch, tagged with the load it belongs to.
struct Completion<T> {
  generation: u64,
  background: bool,
  result: Result<T>,
}

/// A subscription to one category's data for one user.
pub struct OfflineData<T> {
  fetcher: FetcherFn<T>,
  context: CacheContext,
  deps: CacheDeps,
  state: AccessResult<T>,
  generation: u64,
  tx: mpsc::UnboundedSender<Completion<T>>,
  rx: mpsc::UnboundedReceiver<Completion<T>>,
  network_rx: Option<watch::Receiver<bool>>,
  /// Entry to serve if the in-flight blocking fetch fails
  fallback: Option<CacheEntry<T>>,
  background_in_flight: bool,
}

impl<T> OfflineData<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create the subscription and start loading right away.
  ///
  /// Must be called within a tokio runtime: loads that need the network
  /// spawn a task.
  pub fn new<F, Fut>(fetcher: F, context: CacheContext, deps: CacheDeps) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let network_rx = deps.network.subscribe();
    let is_offline = !deps.network.is_online();

    let mut this = Self {
      fetcher: box_fetcher(fetcher),
      context,
      deps,
      state: AccessResult::empty(is_offline),
      generation: 0,
      tx,
      rx,
      network_rx,
      fallback: None,
      background_in_flight: false,
    };
    this.load();
    this
  }

  pub fn result(&self) -> &AccessResult<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn context(&self) -> &CacheContext {
    &self.context
  }

  /// Whether a fetch for the current load is still outstanding.
  pub fn is_pending(&self) -> bool {
    self.state.is_loading || self.background_in_flight
  }

  /// Switch to another category, role or user.
  ///
  /// Setting the current context again is a no-op. Otherwise in-memory data
  /// is dropped (it belongs to the previous identity) and a new load starts.
  pub fn set_context(&mut self, context: CacheContext) {
    if context == self.context {
      return;
    }
    self.context = context;
    self.state.data = None;
    self.state.last_updated = None;
    self.state.source = None;
    self.load();
  }

  /// Replace the fetch function and reload.
  pub fn set_fetcher<F, Fut>(&mut self, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.fetcher = box_fetcher(fetcher);
    self.load();
  }

  /// Run the load cycle again for the current context.
  pub fn reload(&mut self) {
    self.load();
  }

  /// Fetch in the background without entering the loading state.
  ///
  /// Refreshes are coalesced: while one is in flight, further requests are
  /// ignored. Also ignored while a blocking load runs, while offline, or
  /// when the category may not be cached for this role.
  /// Returns whether a refresh was started.
  pub fn revalidate(&mut self) -> bool {
    if self.state.is_loading || !self.deps.network.is_online() || self.cache_policy().is_none() {
      return false;
    }
    self.spawn_fetch(true)
  }

  /// Apply connectivity changes and finished fetches without blocking.
  ///
  /// Returns `true` if the result changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.observe_network();
    while let Ok(completion) = self.rx.try_recv() {
      changed |= self.apply(completion);
    }
    changed
  }

  /// Wait for the next finished fetch of the current load and apply it.
  ///
  /// Returns `false` immediately when nothing is outstanding.
  pub async fn next_update(&mut self) -> bool {
    self.observe_network();
    while self.is_pending() {
      match self.rx.recv().await {
        Some(completion) => {
          if self.apply(completion) {
            return true;
          }
        }
        None => return false,
      }
    }
    false
  }

  /// Wait until no fetch of the current load is outstanding.
  pub async fn settle(&mut self) -> &AccessResult<T> {
    while self.next_update().await {}
    self.poll();
    &self.state
  }

  /// The policy for the current context, if its data may be cached.
  fn cache_policy(&self) -> Option<&CachePolicy> {
    self
      .deps
      .registry
      .find(&self.context.category)
      .filter(|policy| policy.allows(self.context.role))
  }

  fn load(&mut self) {
    self.generation += 1;
    self.background_in_flight = false;
    self.fallback = None;
    self.state.is_loading = true;
    self.state.error = None;
    self.state.is_stale = false;

    let online = self.deps.network.is_online();
    if !online && !self.state.is_offline {
      // Outcomes below depend on it
      info!(is_offline = true, "Connectivity changed");
      self.state.is_offline = true;
    }
    let category = self.context.category.clone();
    debug!(category = %category, role = %self.context.role, generation = self.generation, online, "Loading");

    let Some(policy) = self.deps.registry.find(&category).cloned() else {
      // Unknown categories are network-only
      warn!(category = %category, "No cache policy registered, bypassing cache");
      if online {
        self.spawn_fetch(false);
      } else {
        self.fail(self.permission_denied());
      }
      return;
    };

    if !policy.allows(self.context.role) {
      self.fail(self.permission_denied());
      return;
    }

    let key = self.context.cache_key();
    let entry = match read_entry::<T>(self.deps.storage.as_ref(), &key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Failed to read cache entry, treating as missing");
        None
      }
    };

    let Some(entry) = entry else {
      if online {
        self.spawn_fetch(false);
      } else {
        self.fail(AccessError::NoDataAvailable { category });
      }
      return;
    };

    let is_stale = entry.is_stale(self.deps.clock.now(), policy.max_age);

    if !is_stale || (self.state.is_offline && policy.valid_offline) {
      debug!(key = %key, is_stale, "Serving cached data");
      self.serve_cached(entry, is_stale);
      // The offline observation lags: the network is back, refresh quietly
      if online && is_stale {
        self.spawn_fetch(true);
      }
      return;
    }

    if online {
      if policy.valid_offline {
        self.fallback = Some(entry);
      }
      self.spawn_fetch(false);
    } else if policy.valid_offline {
      self.serve_cached(entry, true);
    } else {
      self.fail(AccessError::NoDataAvailable { category });
    }
  }

  fn permission_denied(&self) -> AccessError {
    AccessError::PermissionDenied {
      category: self.context.category.clone(),
      role: self.context.role,
    }
  }

  fn fail(&mut self, error: AccessError) {
    info!(category = %self.context.category, error = %error, "Load failed");
    self.state.error = Some(error);
    self.state.is_loading = false;
  }

  fn serve_cached(&mut self, entry: CacheEntry<T>, is_stale: bool) {
    self.state.data = Some(entry.payload);
    self.state.last_updated = Some(entry.timestamp);
    self.state.is_stale = is_stale;
    self.state.source = Some(if is_stale {
      DataSource::CacheStale
    } else {
      DataSource::CacheFresh
    });
    self.state.error = None;
    self.state.is_loading = false;
  }

  fn spawn_fetch(&mut self, background: bool) -> bool {
    if background {
      if self.background_in_flight {
        debug!(category = %self.context.category, "Background refresh already in flight");
        return false;
      }
      self.background_in_flight = true;
    }

    let generation = self.generation;
    let tx = self.tx.clone();
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.fetcher)())) {
      Ok(future) => AssertUnwindSafe(future)
        .catch_unwind()
        .map(|outcome| outcome.unwrap_or_else(|_| Err(eyre!("Fetch task panicked"))))
        .boxed(),
      Err(_) => futures::future::ready(Err(eyre!("Fetch function panicked"))).boxed(),
    };

    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - the subscription may have been dropped
      let _ = tx.send(Completion {
        generation,
        background,
        result,
      });
    });
    true
  }

  fn apply(&mut self, completion: Completion<T>) -> bool {
    if completion.generation != self.generation {
      debug!(
        generation = completion.generation,
        current = self.generation,
        "Discarding result of a superseded load"
      );
      return false;
    }

    let background = completion.background;
    if background {
      self.background_in_flight = false;
    } else {
      self.state.is_loading = false;
    }

    match completion.result {
      Ok(data) => self.accept_fresh(data),
      Err(e) if background => {
        warn!(category = %self.context.category, error = %e, "Background refresh failed");
      }
      Err(e) => {
        if let Some(entry) = self.fallback.take() {
          warn!(category = %self.context.category, error = %e, "Fetch failed, serving stale cached data");
          self.serve_cached(entry, true);
        } else if self.state.data.is_none() {
          warn!(category = %self.context.category, error = %e, "Fetch failed with nothing to serve");
          self.state.error = Some(AccessError::FetchFailed(format!("{:#}", e)));
        } else {
          warn!(category = %self.context.category, error = %e, "Fetch failed, keeping previous data");
        }
      }
    }
    true
  }

  fn accept_fresh(&mut self, data: T) {
    let now = self.deps.clock.now();

    if self.cache_policy().is_some() {
      let key = self.context.cache_key();
      if let Err(e) = write_entry(self.deps.storage.as_ref(), &key, &data, now) {
        warn!(key = %key, error = %e, "Failed to store cache entry");
      }
    }

    self.fallback = None;
    self.state.data = Some(data);
    self.state.is_stale = false;
    self.state.error = None;
    self.state.last_updated = Some(now);
    self.state.source = Some(DataSource::Network);
  }

  /// Returns `true` if the observed connectivity changed.
  ///
  /// Coming back online does not trigger a fetch, and going offline keeps
  /// whatever is displayed.
  fn observe_network(&mut self) -> bool {
    let Some(rx) = self.network_rx.as_mut() else {
      return false;
    };

    match rx.has_changed() {
      Ok(true) => {
        let is_offline = !*rx.borrow_and_update();
        if is_offline == self.state.is_offline {
          return false;
        }
        info!(is_offline, "Connectivity changed");
        self.state.is_offline = is_offline;
        true
      }
      Ok(false) => false,
      Err(_) => {
        // Source is gone, keep the last observation
        self.network_rx = None;
        false
      }
    }
  }
}

fn box_fetcher<T, F, Fut>(fetcher: F) -> FetcherFn<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Box::new(move || fetcher().boxed())
}

impl<T: std::fmt::Debug> std::fmt::Debug for OfflineData<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineData")
      .field("context", &self.context)
      .field("state", &self.state)
      .field("generation", &self.generation)
      .finish_non_exhaustive()
  }
}
