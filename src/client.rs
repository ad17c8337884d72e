//! The client facade.
//!
//! A [`QueryClient`] owns one [`QueryCache`], the mutation registry, the
//! defaults registry and the online signal, and exposes the imperative API:
//! typed reads and writes, fetching with deduplication, subscriptions,
//! prefix invalidation, paged fetching and cache snapshots. Clients are
//! cheap to clone; clones share everything.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::error::QueryError;
use crate::infinite::{InfiniteBehavior, InfiniteOptions, InfinitePages};
use crate::key::QueryKey;
use crate::mutation::{MutateFn, Mutation, MutationRegistry};
use crate::observer::{Observer, ObserverOptions};
use crate::persist::{CacheSnapshot, SnapshotEntry};
use crate::query::{FetchFn, FetchKind, Query, QueryConfig, SingleFetch};
use crate::retry::{OnlineState, RetryPolicy};
use crate::state::{DataKind, FetchStatus};

/// What settlement-driven invalidation covers after the last mutation of a
/// scope settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidateOn {
    /// Invalidate the whole cache. Safe default: a write may affect entries
    /// its author did not anticipate.
    #[default]
    All,
    /// Invalidate entries under the mutation's scope prefix; mutations
    /// without a scope still invalidate everything.
    Scope,
    /// No automatic invalidation.
    None,
}

/// Partial per-prefix configuration overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryDefaults {
    /// Freshness window override.
    pub stale_time: Option<Duration>,
    /// Retention window override.
    pub gc_time: Option<Duration>,
    /// Retry policy override.
    pub retry: Option<RetryPolicy>,
}

impl QueryDefaults {
    fn apply(&self, config: &mut QueryConfig) {
        if let Some(stale_time) = self.stale_time {
            config.stale_time = stale_time;
        }
        if let Some(gc_time) = self.gc_time {
            config.gc_time = gc_time;
        }
        if let Some(retry) = &self.retry {
            config.retry = retry.clone();
        }
    }
}

/// Configures and builds a [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    base_config: QueryConfig,
    invalidate_on: InvalidateOn,
}

impl QueryClientBuilder {
    /// Default freshness window for entries without a narrower setting.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.base_config.stale_time = stale_time;
        self
    }

    /// Default retention window after the last observer detaches.
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.base_config.gc_time = gc_time;
        self
    }

    /// Default retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.base_config.retry = retry;
        self
    }

    /// Scope of settlement-driven invalidation.
    pub fn invalidate_on(mut self, invalidate_on: InvalidateOn) -> Self {
        self.invalidate_on = invalidate_on;
        self
    }

    /// Build the client and wire mutation settlement to invalidation.
    pub fn build(self) -> QueryClient {
        let online = OnlineState::new();
        let cache = QueryCache::new(online.clone());
        let mutations = MutationRegistry::new();

        let invalidate_on = self.invalidate_on;
        let hook_cache = cache.clone();
        mutations.set_hook(Arc::new(move |settled| {
            // Overlapping writes coalesce: only the last settlement of a
            // scope triggers invalidation.
            if !settled.is_last_of_scope {
                return;
            }
            match invalidate_on {
                InvalidateOn::None => {}
                InvalidateOn::Scope => {
                    let prefix = settled.scope.clone().unwrap_or_else(|| QueryKey::new(Vec::new()));
                    hook_cache.invalidate_prefix(&prefix);
                }
                InvalidateOn::All => {
                    hook_cache.invalidate_prefix(&QueryKey::new(Vec::new()));
                }
            }
        }));

        QueryClient {
            shared: Arc::new(ClientShared {
                cache,
                mutations,
                defaults: RwLock::new(Vec::new()),
                base_config: self.base_config,
                online,
            }),
        }
    }
}

struct ClientShared {
    cache: Arc<QueryCache>,
    mutations: Arc<MutationRegistry>,
    defaults: RwLock<Vec<(QueryKey, QueryDefaults)>>,
    base_config: QueryConfig,
    online: OnlineState,
}

/// Shared handle to one cache and its surrounding machinery.
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<ClientShared>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Client with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a client.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// The underlying entry store.
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.shared.cache
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Register configuration overrides for every entry under `prefix`.
    ///
    /// Overrides merge by prefix specificity: a longer matching prefix wins
    /// over a shorter one, field by field. Existing entries are unaffected.
    pub fn set_query_defaults(&self, prefix: QueryKey, defaults: QueryDefaults) {
        let mut registry = self.shared.defaults.write();
        if let Some(slot) = registry.iter_mut().find(|(key, _)| *key == prefix) {
            slot.1 = defaults;
        } else {
            registry.push((prefix, defaults));
        }
    }

    /// The resolved configuration an entry created under `key` would get.
    pub fn get_query_defaults(&self, key: &QueryKey) -> QueryConfig {
        self.resolve_config(key)
    }

    fn resolve_config(&self, key: &QueryKey) -> QueryConfig {
        let mut config = self.shared.base_config.clone();
        let registry = self.shared.defaults.read();
        let mut matching: Vec<&(QueryKey, QueryDefaults)> = registry
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix))
            .collect();
        matching.sort_by_key(|(prefix, _)| prefix.len());
        for (_, defaults) in matching {
            defaults.apply(&mut config);
        }
        config
    }

    /// Flip the shared network signal. Going offline pauses in-flight
    /// fetches before their next attempt; coming back online resumes them.
    pub fn set_online(&self, online: bool) {
        debug!(online, "network signal flipped");
        self.shared.online.set_online(online);
    }

    /// Current network signal.
    pub fn is_online(&self) -> bool {
        self.shared.online.is_online()
    }

    // ------------------------------------------------------------------
    // Reads and imperative writes
    // ------------------------------------------------------------------

    /// Typed read of cached data. `None` when the entry is absent, empty, or
    /// holds a different type.
    pub fn get_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        let query = self.shared.cache.get(key)?;
        let data = query.state().data?;
        data.downcast::<T>().ok()
    }

    /// Write data into an entry, creating it if absent.
    ///
    /// Counts as a fresh successful fetch. Any in-flight fetch for the entry
    /// is cancelled first so its late result cannot overwrite this value.
    pub fn set_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        value: T,
    ) -> Result<(), QueryError> {
        let query =
            self.shared
                .cache
                .get_or_create(key, DataKind::Single, || self.resolve_config(key))?;
        query.set_data(Arc::new(value));
        Ok(())
    }

    /// Write data derived from the current value, creating the entry if
    /// absent. The updater sees `None` when there is no current data of `T`.
    pub fn set_data_with<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        update: impl FnOnce(Option<Arc<T>>) -> T,
    ) -> Result<(), QueryError> {
        let query =
            self.shared
                .cache
                .get_or_create(key, DataKind::Single, || self.resolve_config(key))?;
        let current = query.state().data.and_then(|data| data.downcast::<T>().ok());
        query.set_data(Arc::new(update(current)));
        Ok(())
    }

    /// Remove every entry under `prefix` outright.
    pub fn remove(&self, prefix: &QueryKey) {
        for query in self.shared.cache.find_by_prefix(prefix) {
            self.shared.cache.remove(query.key());
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.shared.cache.clear();
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    fn single_entry(&self, key: &QueryKey, fetch: FetchFn) -> Result<Arc<Query>, QueryError> {
        let query =
            self.shared
                .cache
                .get_or_create(key, DataKind::Single, || self.resolve_config(key))?;
        // The fetch function is remembered, so invalidation can refetch
        // without the caller around.
        query.set_fetcher(fetch, Arc::new(SingleFetch));
        Ok(query)
    }

    /// Fetch an entry, deduplicating against any in-flight fetch for the
    /// same key, and return its typed data.
    pub async fn fetch_query<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        fetch: FetchFn,
    ) -> Result<Arc<T>, QueryError> {
        let query = self.single_entry(key, fetch)?;
        let data = query.fetch(FetchKind::Refetch).await?;
        data.downcast::<T>().map_err(|_| QueryError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
    }

    /// Return cached data if present and fresh, fetching otherwise.
    pub async fn ensure_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        fetch: FetchFn,
    ) -> Result<Arc<T>, QueryError> {
        let query = self.single_entry(key, fetch)?;
        if !query.is_stale() {
            if let Some(data) = query.state().data {
                if let Ok(data) = data.downcast::<T>() {
                    return Ok(data);
                }
            }
        }
        let data = query.fetch(FetchKind::Refetch).await?;
        data.downcast::<T>().map_err(|_| QueryError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
    }

    /// Warm the cache. Fetches only when the entry is stale; fetch errors
    /// are recorded in the entry but not surfaced here.
    pub async fn prefetch(&self, key: &QueryKey, fetch: FetchFn) {
        let query = match self.single_entry(key, fetch) {
            Ok(query) => query,
            Err(error) => {
                warn!(key = %key.debug_repr(), %error, "prefetch skipped");
                return;
            }
        };
        if query.is_stale() {
            let _ = query.fetch(FetchKind::Refetch).await;
        }
    }

    /// Refetch every entry under `prefix` that has a remembered fetch
    /// function, regardless of freshness.
    pub async fn refetch(&self, prefix: &QueryKey) {
        let queries = self.shared.cache.find_by_prefix(prefix);
        let fetches = queries
            .into_iter()
            .filter(|query| query.has_fetcher())
            .map(|query| async move {
                let _ = query.fetch(FetchKind::Refetch).await;
            });
        futures::future::join_all(fetches).await;
    }

    /// Mark every entry under `prefix` stale. Actively observed entries
    /// refetch immediately; the rest refetch lazily on next access.
    pub fn invalidate(&self, prefix: &QueryKey) {
        self.shared.cache.invalidate_prefix(prefix);
    }

    /// Cancel the in-flight fetch for `key`, if any. Cached data and status
    /// are untouched; waiters observe [`QueryError::Cancelled`].
    pub fn cancel(&self, key: &QueryKey) {
        if let Some(query) = self.shared.cache.get(key) {
            query.cancel_fetch();
        }
    }

    /// Number of entries under `prefix` with an execution in flight or
    /// paused. An empty prefix counts the whole cache.
    pub fn is_fetching(&self, prefix: &QueryKey) -> usize {
        self.shared
            .cache
            .find_by_prefix(prefix)
            .iter()
            .filter(|query| query.state().fetch_status != FetchStatus::Idle)
            .count()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to an entry with the identity projection.
    pub fn observe<T>(
        &self,
        key: &QueryKey,
        fetch: FetchFn,
        options: ObserverOptions,
    ) -> Result<Arc<Observer<T>>, QueryError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.observe_with(key, fetch, options, |value: &T| value.clone())
    }

    /// Subscribe to an entry through a projection. The selector runs once
    /// per data change; a projection that compares equal to the previous one
    /// is not a change.
    pub fn observe_with<T, S>(
        &self,
        key: &QueryKey,
        fetch: FetchFn,
        options: ObserverOptions,
        select: impl Fn(&T) -> S + Send + Sync + 'static,
    ) -> Result<Arc<Observer<T, S>>, QueryError>
    where
        T: Send + Sync + 'static,
        S: PartialEq + Send + Sync + 'static,
    {
        let query = self.single_entry(key, fetch)?;
        let observer = Observer::attach(query.clone(), &options, Arc::new(select));
        if options.enabled && options.refetch_on_subscribe && query.is_stale() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = query.fetch(FetchKind::Refetch).await;
                });
            }
        }
        Ok(observer)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a mutation handle. Scope it with [`Mutation::with_scope`] to
    /// target settlement-driven invalidation.
    pub fn mutation<V, R>(&self, mutate: MutateFn<V, R>) -> Mutation<V, R>
    where
        V: Send + 'static,
        R: Send + Sync + 'static,
    {
        Mutation::new(self.shared.mutations.clone(), mutate)
    }

    /// Number of pending mutations scoped under `prefix`; `None` counts all.
    pub fn is_mutating(&self, prefix: Option<&QueryKey>) -> usize {
        self.shared.mutations.pending_count(prefix)
    }

    // ------------------------------------------------------------------
    // Paged fetching
    // ------------------------------------------------------------------

    /// Fetch a paged entry: replays its known pages from the first one, or
    /// fetches the first page if none are cached yet.
    ///
    /// The entry's shape is fixed as paged on creation; a single-value entry
    /// under the same key is a [`QueryError::KindMismatch`].
    pub async fn fetch_infinite(
        &self,
        key: &QueryKey,
        fetch: FetchFn,
        options: InfiniteOptions,
    ) -> Result<Arc<InfinitePages>, QueryError> {
        let query =
            self.shared
                .cache
                .get_or_create(key, DataKind::Pages, || self.resolve_config(key))?;
        query.set_fetcher(fetch, Arc::new(InfiniteBehavior { options }));
        let data = query.fetch(FetchKind::Refetch).await?;
        data.downcast::<InfinitePages>()
            .map_err(|_| QueryError::TypeMismatch {
                expected: std::any::type_name::<InfinitePages>(),
            })
    }

    /// Append the next page to a paged entry previously set up by
    /// [`QueryClient::fetch_infinite`]. A no-op returning the current list
    /// when the cursor reports the list complete.
    pub async fn fetch_next_page(&self, key: &QueryKey) -> Result<Arc<InfinitePages>, QueryError> {
        let query = self
            .shared
            .cache
            .get(key)
            .ok_or(QueryError::MissingFetchFn)?;
        if query.kind() != DataKind::Pages {
            return Err(QueryError::KindMismatch {
                expected: DataKind::Pages,
                actual: query.kind(),
            });
        }
        let data = query.fetch(FetchKind::NextPage).await?;
        data.downcast::<InfinitePages>()
            .map_err(|_| QueryError::TypeMismatch {
                expected: std::any::type_name::<InfinitePages>(),
            })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture every entry that currently holds data.
    pub fn snapshot(&self) -> CacheSnapshot {
        let entries = self
            .shared
            .cache
            .queries()
            .into_iter()
            .filter_map(|query| {
                let state = query.state();
                let data = state.data?;
                let age = state
                    .data_updated_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                Some(SnapshotEntry {
                    key: query.key().clone(),
                    kind: query.kind(),
                    data,
                    age,
                })
            })
            .collect();
        CacheSnapshot { entries }
    }

    /// Write a snapshot back into the cache.
    ///
    /// Each entry's age is preserved relative to now, so staleness checks
    /// after restore behave as if the data had been fetched that long ago.
    /// Entries whose key already holds the other data shape are skipped.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        let now = tokio::time::Instant::now();
        for entry in snapshot.entries {
            let query = match self.shared.cache.get_or_create(&entry.key, entry.kind, || {
                self.resolve_config(&entry.key)
            }) {
                Ok(query) => query,
                Err(error) => {
                    warn!(key = %entry.key.debug_repr(), %error, "snapshot entry skipped");
                    continue;
                }
            };
            let written_at = now.checked_sub(entry.age).unwrap_or(now);
            query.set_data_at(entry.data, written_at);
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.shared.cache)
            .field("online", &self.shared.online.is_online())
            .finish()
    }
}
