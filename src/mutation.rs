//! Imperative write operations and their settlement tracking.
//!
//! Mutations are not cached and never retried. The engine tracks which
//! mutations are pending per scope so that cache invalidation after a burst
//! of overlapping writes fires once, when the last one settles, instead of
//! once per write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::state::SharedError;

/// The external mutate-function contract: variables in, result out, executed
/// exactly once per [`Mutation::run`].
pub type MutateFn<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Lifecycle of one mutation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Never run.
    Idle,
    /// An execution is in flight.
    Pending,
    /// The last execution resolved.
    Success,
    /// The last execution rejected.
    Error,
}

/// Observable state of a mutation handle.
pub struct MutationState<R> {
    /// Lifecycle status.
    pub status: MutationStatus,
    /// Result of the last successful execution.
    pub data: Option<Arc<R>>,
    /// Error of the last failed execution.
    pub error: Option<SharedError>,
}

impl<R> Clone for MutationState<R> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<R> Default for MutationState<R> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// Settlement notice handed to the registry hook.
pub(crate) struct MutationSettled {
    /// Scope of the settled mutation, when one was declared.
    pub scope: Option<QueryKey>,
    /// Whether no other mutation of the same scope is still pending.
    pub is_last_of_scope: bool,
}

type SettledHook = Arc<dyn Fn(MutationSettled) + Send + Sync>;

/// Tracks pending mutations across the client.
pub(crate) struct MutationRegistry {
    pending: Mutex<HashMap<u64, Option<QueryKey>>>,
    next_id: AtomicU64,
    on_settled: RwLock<Option<SettledHook>>,
}

impl MutationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            on_settled: RwLock::new(None),
        })
    }

    pub fn set_hook(&self, hook: SettledHook) {
        *self.on_settled.write() = Some(hook);
    }

    fn begin(&self, scope: Option<QueryKey>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(id, scope);
        id
    }

    fn settle(&self, id: u64) {
        let settled = {
            let mut pending = self.pending.lock();
            let scope = pending.remove(&id).flatten();
            let is_last_of_scope = !pending.values().any(|other| other.as_ref() == scope.as_ref());
            MutationSettled {
                scope,
                is_last_of_scope,
            }
        };
        debug!(
            scope = settled.scope.as_ref().map(|s| s.debug_repr()),
            last = settled.is_last_of_scope,
            "mutation settled"
        );
        let hook = self.on_settled.read().clone();
        if let Some(hook) = hook {
            hook(settled);
        }
    }

    /// Number of pending mutations whose scope starts with `prefix`.
    /// `None` counts every pending mutation.
    pub fn pending_count(&self, prefix: Option<&QueryKey>) -> usize {
        let pending = self.pending.lock();
        match prefix {
            None => pending.len(),
            Some(prefix) => pending
                .values()
                .filter(|scope| {
                    scope
                        .as_ref()
                        .is_some_and(|scope| scope.starts_with(prefix))
                })
                .count(),
        }
    }
}

/// A reusable write operation.
///
/// `V` is the variables type, `R` the result type. The handle's state
/// reflects its most recent run.
pub struct Mutation<V, R> {
    registry: Arc<MutationRegistry>,
    mutate: MutateFn<V, R>,
    scope: Option<QueryKey>,
    state: Mutex<MutationState<R>>,
}

impl<V, R> Mutation<V, R>
where
    V: Send + 'static,
    R: Send + Sync + 'static,
{
    pub(crate) fn new(registry: Arc<MutationRegistry>, mutate: MutateFn<V, R>) -> Self {
        Self {
            registry,
            mutate,
            scope: None,
            state: Mutex::new(MutationState::default()),
        }
    }

    /// Declare the cache scope this mutation affects. Settlement-driven
    /// invalidation is restricted to entries under this key prefix, and
    /// last-of-scope coalescing groups mutations by it.
    pub fn with_scope(mut self, scope: QueryKey) -> Self {
        self.scope = Some(scope);
        self
    }

    /// State of the most recent run.
    pub fn state(&self) -> MutationState<R> {
        self.state.lock().clone()
    }

    /// Execute the mutate function once. No retry: write side effects are
    /// not assumed idempotent.
    pub async fn run(&self, variables: V) -> Result<Arc<R>, QueryError> {
        let id = self.registry.begin(self.scope.clone());
        {
            let mut state = self.state.lock();
            state.status = MutationStatus::Pending;
            state.error = None;
        }

        let result = (self.mutate)(variables).await;
        match result {
            Ok(value) => {
                let value = Arc::new(value);
                {
                    let mut state = self.state.lock();
                    state.status = MutationStatus::Success;
                    state.data = Some(value.clone());
                }
                self.registry.settle(id);
                Ok(value)
            }
            Err(error) => {
                let error: SharedError = Arc::new(error);
                {
                    let mut state = self.state.lock();
                    state.status = MutationStatus::Error;
                    state.error = Some(error.clone());
                }
                // Settlement fires on failure too: dependents refetch to
                // learn whether the write partially applied.
                self.registry.settle(id);
                Err(QueryError::Fetch(error))
            }
        }
    }
}
