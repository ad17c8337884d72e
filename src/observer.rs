//! Typed subscriptions to cache entries.
//!
//! An [`Observer`] attaches to one [`Query`] and re-exposes its state through
//! a typed, optionally projected lens. Two mechanisms keep notifications
//! quiet: field tracking (reading a snapshot field marks it tracked, and only
//! tracked fields trigger the listener) and structural sharing (a recomputed
//! projection that compares equal keeps the previous allocation, so it does
//! not count as a data change).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::QueryError;
use crate::query::{FetchKind, Query};
use crate::state::{FetchStatus, QueryState, QueryStatus, SharedError};

bitflags! {
    /// Snapshot fields an observer has read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrackedFields: u8 {
        const DATA = 1 << 0;
        const ERROR = 1 << 1;
        const STATUS = 1 << 2;
        const FETCH_STATUS = 1 << 3;
        const FAILURE_COUNT = 1 << 4;
    }
}

/// Per-observer options.
#[derive(Debug, Clone)]
pub struct ObserverOptions {
    /// Freshness window override; `None` inherits the entry's configuration.
    pub stale_time: Option<Duration>,
    /// Disabled observers never trigger fetches and do not count towards the
    /// entry's effective freshness window.
    pub enabled: bool,
    /// Fetch on attach when the entry is stale.
    pub refetch_on_subscribe: bool,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            stale_time: None,
            enabled: true,
            refetch_on_subscribe: true,
        }
    }
}

/// Callback invoked with a fresh snapshot after a tracked change.
type Listener<S> = Arc<dyn Fn(QuerySnapshot<S>) + Send + Sync>;

/// Internal hook [`Query`] uses to fan out state changes.
pub(crate) trait AnyObserver: Send + Sync {
    fn on_query_update(&self, state: &QueryState);
    fn stale_time(&self) -> Duration;
    fn is_enabled(&self) -> bool;
}

/// One observed view of a query's state.
///
/// Reading a field marks it tracked for the owning observer; subsequent
/// listener calls only happen when a tracked field changes.
#[derive(Clone)]
pub struct QuerySnapshot<S> {
    status: QueryStatus,
    fetch_status: FetchStatus,
    data: Option<Arc<S>>,
    error: Option<SharedError>,
    failure_count: u32,
    tracked: Arc<AtomicU8>,
}

impl<S> QuerySnapshot<S> {
    fn track(&self, field: TrackedFields) {
        self.tracked.fetch_or(field.bits(), Ordering::Relaxed);
    }

    /// Data-availability status.
    pub fn status(&self) -> QueryStatus {
        self.track(TrackedFields::STATUS);
        self.status
    }

    /// Execution status.
    pub fn fetch_status(&self) -> FetchStatus {
        self.track(TrackedFields::FETCH_STATUS);
        self.fetch_status
    }

    /// Projected data, if any. Shared: an unchanged projection keeps its
    /// previous allocation across refetches.
    pub fn data(&self) -> Option<Arc<S>> {
        self.track(TrackedFields::DATA);
        self.data.clone()
    }

    /// Error of the last exhausted fetch, possibly alongside stale data.
    pub fn error(&self) -> Option<SharedError> {
        self.track(TrackedFields::ERROR);
        self.error.clone()
    }

    /// Consecutive failures of the current fetch.
    pub fn failure_count(&self) -> u32 {
        self.track(TrackedFields::FAILURE_COUNT);
        self.failure_count
    }
}

struct Seen<S> {
    state: QueryState,
    projection: Option<Arc<S>>,
}

/// Typed subscription to one cache entry.
///
/// `T` is the cached data type; `S` the projected view handed to snapshots
/// (the selector runs once per data change, not per read). Dropping the
/// observer detaches it; the last detachment starts the entry's gc timer.
pub struct Observer<T, S = T> {
    query: Arc<Query>,
    id: AtomicU64,
    stale_time: Mutex<Duration>,
    enabled: Mutex<bool>,
    select: Arc<dyn Fn(&T) -> S + Send + Sync>,
    tracked: Arc<AtomicU8>,
    seen: Mutex<Seen<S>>,
    listener: Mutex<Option<Listener<S>>>,
    notify: Notify,
}

impl<T, S> Observer<T, S>
where
    T: Send + Sync + 'static,
    S: PartialEq + Send + Sync + 'static,
{
    pub(crate) fn attach(
        query: Arc<Query>,
        options: &ObserverOptions,
        select: Arc<dyn Fn(&T) -> S + Send + Sync>,
    ) -> Arc<Self> {
        let stale_time = options
            .stale_time
            .unwrap_or_else(|| query.config().stale_time);
        let state = query.state();
        let observer = Arc::new(Self {
            query: query.clone(),
            id: AtomicU64::new(0),
            stale_time: Mutex::new(stale_time),
            enabled: Mutex::new(options.enabled),
            select,
            tracked: Arc::new(AtomicU8::new(0)),
            seen: Mutex::new(Seen {
                projection: None,
                state: state.clone(),
            }),
            listener: Mutex::new(None),
            notify: Notify::new(),
        });
        observer.seen.lock().projection = observer.project(&state);
        let erased: Arc<dyn AnyObserver> = observer.clone();
        let id = query.add_observer(&erased);
        observer.id.store(id, Ordering::SeqCst);
        observer
    }

    /// The entry this observer watches.
    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Current snapshot. Field reads on it mark those fields tracked.
    pub fn current(&self) -> QuerySnapshot<S> {
        let seen = self.seen.lock();
        self.snapshot_of(&seen)
    }

    /// Whether the watched entry is stale for this observer.
    pub fn is_stale(&self) -> bool {
        self.query.is_stale()
    }

    /// Register the change listener, replacing any previous one.
    pub fn subscribe(&self, listener: impl Fn(QuerySnapshot<S>) + Send + Sync + 'static) {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    /// Enable or disable this observer.
    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    /// Override the freshness window for this observer.
    pub fn set_stale_time(&self, stale_time: Duration) {
        *self.stale_time.lock() = stale_time;
    }

    /// Force a fetch of the watched entry, joining any in-flight one.
    pub async fn refetch(&self) -> Result<(), QueryError> {
        self.query.clone().fetch(FetchKind::Refetch).await.map(|_| ())
    }

    /// Resolves once the entry has settled at least once, with data or error.
    pub async fn wait_for_result(&self) -> QuerySnapshot<S> {
        loop {
            let notified = self.notify.notified();
            if self.seen.lock().state.status != QueryStatus::Pending {
                return self.current();
            }
            notified.await;
        }
    }

    fn project(&self, state: &QueryState) -> Option<Arc<S>> {
        let data = state.data.as_ref()?;
        let value = data.downcast_ref::<T>()?;
        Some(Arc::new((self.select)(value)))
    }

    fn snapshot_of(&self, seen: &Seen<S>) -> QuerySnapshot<S> {
        QuerySnapshot {
            status: seen.state.status,
            fetch_status: seen.state.fetch_status,
            data: seen.projection.clone(),
            error: seen.state.error.clone(),
            failure_count: seen.state.fetch_failure_count,
            tracked: self.tracked.clone(),
        }
    }
}

impl<T, S> AnyObserver for Observer<T, S>
where
    T: Send + Sync + 'static,
    S: PartialEq + Send + Sync + 'static,
{
    fn on_query_update(&self, state: &QueryState) {
        let (snapshot, fire) = {
            let mut seen = self.seen.lock();
            let mut changed = TrackedFields::empty();
            if seen.state.status != state.status {
                changed |= TrackedFields::STATUS;
            }
            if seen.state.fetch_status != state.fetch_status {
                changed |= TrackedFields::FETCH_STATUS;
            }
            if seen.state.fetch_failure_count != state.fetch_failure_count {
                changed |= TrackedFields::FAILURE_COUNT;
            }
            let error_changed = match (&seen.state.error, &state.error) {
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                (None, None) => false,
                _ => true,
            };
            if error_changed {
                changed |= TrackedFields::ERROR;
            }
            let raw_data_changed = match (&seen.state.data, &state.data) {
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                (None, None) => false,
                _ => true,
            };
            if raw_data_changed {
                let fresh = self.project(state);
                match (&seen.projection, &fresh) {
                    // Structural sharing: an equal projection keeps the
                    // previous allocation and does not count as a change.
                    (Some(old), Some(new)) if **old == **new => {
                        trace!("projection unchanged, keeping previous allocation");
                    }
                    (None, None) => {}
                    _ => {
                        seen.projection = fresh;
                        changed |= TrackedFields::DATA;
                    }
                }
            }
            seen.state = state.clone();

            let tracked = TrackedFields::from_bits_truncate(self.tracked.load(Ordering::Relaxed));
            // Until the first snapshot read we cannot know what the consumer
            // cares about; treat everything as tracked.
            let fire = if tracked.is_empty() {
                !changed.is_empty()
            } else {
                changed.intersects(tracked)
            };
            (self.snapshot_of(&seen), fire)
        };

        self.notify.notify_waiters();
        if fire {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener(snapshot);
            }
        }
    }

    fn stale_time(&self) -> Duration {
        *self.stale_time.lock()
    }

    fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }
}

impl<T, S> Drop for Observer<T, S> {
    fn drop(&mut self) {
        let id = self.id.load(Ordering::SeqCst);
        if id != 0 {
            self.query.remove_observer(id);
        }
    }
}
