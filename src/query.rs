//! One cache entry per unique key, and its fetch orchestration.
//!
//! A [`Query`] owns the entry's [`QueryState`], the set of attached
//! observers (back-references only; observers are owned by subscribers), a
//! generation counter used to discard superseded in-flight results, and the
//! in-flight execution handle used to deduplicate concurrent fetches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::QueryCache;
use crate::error::QueryError;
use crate::key::{QueryHash, QueryKey};
use crate::observer::AnyObserver;
use crate::retry::{OnlineState, RetryEvent, RetryOutcome, RetryPolicy, Retryer};
use crate::state::{DataKind, QueryState, SharedData};

/// Future returned by a fetch function.
pub type FetchFuture = BoxFuture<'static, anyhow::Result<SharedData>>;

/// The external fetch-function contract.
///
/// The engine places no constraint on how the function executes; it only
/// needs a settleable asynchronous result. All inputs the function depends on
/// must be declared in the key — the [`FetchContext`] is the only channel the
/// engine threads through, which keeps ambient captures out of the cache
/// identity.
pub type FetchFn = Arc<dyn Fn(FetchContext) -> FetchFuture + Send + Sync>;

/// Inputs handed to a fetch function for one execution.
pub struct FetchContext {
    /// The key being fetched.
    pub key: QueryKey,
    /// Cooperative cancellation signal. Pass it down or ignore it; a stale
    /// settlement is discarded either way.
    pub cancel: CancellationToken,
    /// Page parameter, set only for paged fetches.
    pub page_param: Option<SharedData>,
}

/// Wrap a typed asynchronous function into a [`FetchFn`].
///
/// # Example
///
/// ```ignore
/// let fetch = fetch_fn(|ctx| async move { Ok(load_user(&ctx.key).await?) });
/// ```
pub fn fetch_fn<T, F, Fut>(f: F) -> FetchFn
where
    T: Send + Sync + 'static,
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |ctx| {
        let fut = f(ctx);
        Box::pin(async move { fut.await.map(|value| Arc::new(value) as SharedData) })
    })
}

/// Why a fetch was started. Single-value fetches ignore this; paged
/// behaviors use it to distinguish a refetch from an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Refresh the entry's current data shape.
    Refetch,
    /// Extend a page list by one page.
    NextPage,
}

/// Inputs handed to a [`FetchBehavior`] for one execution.
pub struct BehaviorContext {
    /// The key being fetched.
    pub key: QueryKey,
    /// Why this execution was started.
    pub kind: FetchKind,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
    /// The registered fetch function.
    pub fetch: FetchFn,
    /// The entry's data before this execution started.
    pub previous: Option<SharedData>,
}

/// Composable wrapper around a query's fetch step.
///
/// The default behavior runs the fetch function once; the paged behavior
/// behind [`crate::InfiniteOptions`] turns it into a sequence of page
/// fetches without altering caching, retry or notification mechanics.
pub trait FetchBehavior: Send + Sync {
    /// Produce the entry's next data value.
    fn run(&self, ctx: BehaviorContext) -> FetchFuture;
}

/// Default behavior: one execution of the fetch function per fetch.
pub(crate) struct SingleFetch;

impl FetchBehavior for SingleFetch {
    fn run(&self, ctx: BehaviorContext) -> FetchFuture {
        (ctx.fetch)(FetchContext {
            key: ctx.key,
            cancel: ctx.cancel,
            page_param: None,
        })
    }
}

/// Per-entry configuration.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long a successful fetch counts as fresh when no observer narrows
    /// it. Defaults to zero: always revalidate.
    pub stale_time: Duration,
    /// Retention window after the last observer detaches.
    pub gc_time: Duration,
    /// Backoff policy for this entry's fetches.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result every waiter of a (possibly deduplicated) fetch receives.
pub(crate) type FetchSettled = Result<SharedData, QueryError>;

#[derive(Clone)]
pub(crate) struct StoredFetch {
    pub fetch: FetchFn,
    pub behavior: Arc<dyn FetchBehavior>,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    rx: watch::Receiver<Option<FetchSettled>>,
}

struct ObserverSlot {
    id: u64,
    observer: Weak<dyn AnyObserver>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One cache entry: state, observers, and fetch orchestration.
pub struct Query {
    hash: QueryHash,
    key: QueryKey,
    kind: DataKind,
    config: Mutex<QueryConfig>,
    state: Mutex<QueryState>,
    observers: Mutex<Vec<ObserverSlot>>,
    inflight: Mutex<Option<InFlight>>,
    fetcher: Mutex<Option<StoredFetch>>,
    generation: AtomicU64,
    next_observer_id: AtomicU64,
    gc_timer: Mutex<Option<AbortOnDrop>>,
    cache: Weak<QueryCache>,
    online: OnlineState,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCache>,
        key: QueryKey,
        kind: DataKind,
        config: QueryConfig,
        online: OnlineState,
    ) -> Arc<Self> {
        let query = Arc::new(Self {
            hash: key.hash_value(),
            key,
            kind,
            config: Mutex::new(config),
            state: Mutex::new(QueryState::new()),
            observers: Mutex::new(Vec::new()),
            inflight: Mutex::new(None),
            fetcher: Mutex::new(None),
            generation: AtomicU64::new(0),
            next_observer_id: AtomicU64::new(1),
            gc_timer: Mutex::new(None),
            cache,
            online,
        });
        // Entries start unobserved; the retention window begins immediately.
        query.arm_gc();
        query
    }

    /// The entry's key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The entry's canonical hash.
    pub fn hash(&self) -> QueryHash {
        self.hash
    }

    /// The data shape this entry was created with.
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Snapshot of the entry's current state.
    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        let mut slots = self.observers.lock();
        slots.retain(|slot| slot.observer.strong_count() > 0);
        slots.len()
    }

    /// Whether any attached observer is enabled.
    pub fn is_active(&self) -> bool {
        self.observers
            .lock()
            .iter()
            .filter_map(|slot| slot.observer.upgrade())
            .any(|observer| observer.is_enabled())
    }

    /// Whether the entry is stale for the most demanding attached observer.
    ///
    /// The effective window is the minimum `stale_time` across enabled
    /// observers, falling back to the entry's configured default.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.effective_stale_time();
        self.state.lock().is_stale(stale_time)
    }

    fn effective_stale_time(&self) -> Duration {
        self.observers
            .lock()
            .iter()
            .filter_map(|slot| slot.observer.upgrade())
            .filter(|observer| observer.is_enabled())
            .map(|observer| observer.stale_time())
            .min()
            .unwrap_or_else(|| self.config.lock().stale_time)
    }

    pub(crate) fn config(&self) -> QueryConfig {
        self.config.lock().clone()
    }

    pub(crate) fn set_fetcher(&self, fetch: FetchFn, behavior: Arc<dyn FetchBehavior>) {
        *self.fetcher.lock() = Some(StoredFetch { fetch, behavior });
    }

    pub(crate) fn has_fetcher(&self) -> bool {
        self.fetcher.lock().is_some()
    }

    // ------------------------------------------------------------------
    // Fetch orchestration
    // ------------------------------------------------------------------

    /// Fetch this entry, deduplicating against any in-flight execution.
    ///
    /// At most one execution is outstanding per entry at any time: a call
    /// made while one is in flight joins it and receives the same settled
    /// outcome instead of starting a second execution.
    pub(crate) async fn fetch(self: Arc<Self>, kind: FetchKind) -> FetchSettled {
        enum Plan {
            Join(watch::Receiver<Option<FetchSettled>>),
            Start {
                generation: u64,
                cancel: CancellationToken,
                tx: watch::Sender<Option<FetchSettled>>,
                rx: watch::Receiver<Option<FetchSettled>>,
                stored: StoredFetch,
            },
        }

        let plan = {
            let mut inflight = self.inflight.lock();
            // A cancelled execution is not joinable: its settlement is
            // already decided. A fetch arriving after cancellation starts a
            // fresh execution that supersedes it.
            let join_rx = inflight
                .as_ref()
                .filter(|running| !running.cancel.is_cancelled())
                .map(|running| running.rx.clone());
            if let Some(rx) = join_rx {
                trace!(key = %self.key.debug_repr(), "joining in-flight fetch");
                Plan::Join(rx)
            } else {
                let stored = match self.fetcher.lock().clone() {
                    Some(stored) => stored,
                    None => return Err(QueryError::MissingFetchFn),
                };
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = CancellationToken::new();
                let (tx, rx) = watch::channel(None);
                *inflight = Some(InFlight {
                    generation,
                    cancel: cancel.clone(),
                    rx: rx.clone(),
                });
                self.state.lock().on_fetch_start();
                Plan::Start {
                    generation,
                    cancel,
                    tx,
                    rx,
                    stored,
                }
            }
        };

        match plan {
            Plan::Join(mut rx) => Self::settled(&mut rx).await,
            Plan::Start {
                generation,
                cancel,
                tx,
                mut rx,
                stored,
            } => {
                debug!(key = %self.key.debug_repr(), generation, "fetch started");
                self.notify_observers();
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_fetch(generation, kind, cancel, stored, tx).await;
                });
                Self::settled(&mut rx).await
            }
        }
    }

    async fn settled(rx: &mut watch::Receiver<Option<FetchSettled>>) -> FetchSettled {
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(settled) => settled.clone(),
                None => Err(QueryError::Cancelled),
            },
            // The sender is gone without settling; treat as cancellation.
            Err(_) => Err(QueryError::Cancelled),
        }
    }

    async fn run_fetch(
        self: Arc<Self>,
        generation: u64,
        kind: FetchKind,
        cancel: CancellationToken,
        stored: StoredFetch,
        tx: watch::Sender<Option<FetchSettled>>,
    ) {
        let previous = self.state.lock().data.clone();
        let policy = self.config.lock().retry.clone();
        let retryer = Retryer {
            policy,
            cancel,
            online: self.online.clone(),
        };
        let key = self.key.clone();
        let events = self.clone();
        let outcome = retryer
            .run(
                |token| {
                    stored.behavior.run(BehaviorContext {
                        key: key.clone(),
                        kind,
                        cancel: token,
                        fetch: stored.fetch.clone(),
                        previous: previous.clone(),
                    })
                },
                |event| events.on_retry_event(generation, event),
            )
            .await;
        let settled = self.apply_outcome(generation, outcome);
        let _ = tx.send(Some(settled));
    }

    fn on_retry_event(&self, generation: u64, event: RetryEvent) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut state = self.state.lock();
            match event {
                RetryEvent::Failed { .. } => state.on_failure(),
                RetryEvent::Paused => state.on_fetch_pause(),
                RetryEvent::Resumed => state.on_fetch_resume(),
            }
        }
        self.notify_observers();
    }

    /// Apply a terminal outcome, attributing it by generation: a settlement
    /// belonging to a superseded generation is discarded regardless of
    /// arrival order.
    fn apply_outcome(&self, generation: u64, outcome: RetryOutcome<SharedData>) -> FetchSettled {
        let settled = {
            let mut inflight = self.inflight.lock();
            let superseded = self.generation.load(Ordering::SeqCst) != generation;
            let mut state = self.state.lock();
            let settled = match outcome {
                RetryOutcome::Resolved(data) => {
                    if superseded {
                        trace!(key = %self.key.debug_repr(), generation, "discarding superseded result");
                        Err(QueryError::Cancelled)
                    } else {
                        state.on_success(data.clone(), Instant::now());
                        Ok(data)
                    }
                }
                RetryOutcome::Failed(error) => {
                    if superseded {
                        Err(QueryError::Cancelled)
                    } else {
                        debug!(key = %self.key.debug_repr(), %error, "fetch failed, retries exhausted");
                        state.on_error(error.clone(), Instant::now());
                        Err(QueryError::Fetch(error))
                    }
                }
                RetryOutcome::Cancelled => {
                    if !superseded {
                        state.on_cancel();
                    }
                    Err(QueryError::Cancelled)
                }
            };
            if inflight
                .as_ref()
                .is_some_and(|running| running.generation == generation)
            {
                *inflight = None;
            }
            settled
        };
        self.notify_observers();
        settled
    }

    /// Abort the in-flight execution, if any. Cancellation is cooperative
    /// and neutral: `status` and `data` are untouched.
    pub fn cancel_fetch(&self) {
        let token = self
            .inflight
            .lock()
            .as_ref()
            .map(|running| running.cancel.clone());
        if let Some(token) = token {
            debug!(key = %self.key.debug_repr(), "cancelling in-flight fetch");
            token.cancel();
        }
    }

    /// Mark the entry stale regardless of its age.
    pub(crate) fn invalidate(&self) {
        self.state.lock().is_invalidated = true;
        self.notify_observers();
    }

    /// Imperatively write data into the entry.
    ///
    /// Any in-flight fetch is cancelled first and the generation bumped, so
    /// a late-arriving result of the superseded execution cannot overwrite
    /// this write.
    pub(crate) fn set_data(&self, data: SharedData) {
        self.set_data_at(data, Instant::now());
    }

    pub(crate) fn set_data_at(&self, data: SharedData, at: Instant) {
        self.cancel_fetch();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.lock().on_success(data, at);
        self.notify_observers();
    }

    // ------------------------------------------------------------------
    // Observers and garbage collection
    // ------------------------------------------------------------------

    pub(crate) fn add_observer(&self, observer: &Arc<dyn AnyObserver>) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().push(ObserverSlot {
            id,
            observer: Arc::downgrade(observer),
        });
        self.disarm_gc();
        id
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        let empty = {
            let mut slots = self.observers.lock();
            slots.retain(|slot| slot.id != id && slot.observer.strong_count() > 0);
            slots.is_empty()
        };
        if empty {
            self.arm_gc();
        }
    }

    pub(crate) fn notify_observers(&self) {
        let state = self.state.lock().clone();
        let observers: Vec<Arc<dyn AnyObserver>> = {
            let mut slots = self.observers.lock();
            slots.retain(|slot| slot.observer.strong_count() > 0);
            slots
                .iter()
                .filter_map(|slot| slot.observer.upgrade())
                .collect()
        };
        for observer in observers {
            observer.on_query_update(&state);
        }
    }

    /// Start the retention timer. Disarmed again if an observer attaches
    /// before expiry.
    fn arm_gc(&self) {
        let gc_time = self.config.lock().gc_time;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = self.cache.clone();
        let hash = self.hash;
        let task = handle.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(cache) = cache.upgrade() {
                cache.remove_if_unused(&hash);
            }
        });
        *self.gc_timer.lock() = Some(AbortOnDrop(task));
    }

    fn disarm_gc(&self) {
        self.gc_timer.lock().take();
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .field("kind", &self.kind)
            .field("state", &*self.state.lock())
            .finish()
    }
}
