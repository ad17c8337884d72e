//! The shared entry store.
//!
//! A [`QueryCache`] maps canonical key hashes to [`Query`] entries. It is the
//! single authority for entry creation (where the data-shape check happens),
//! removal, and bulk lookups by key prefix.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::QueryError;
use crate::key::{QueryHash, QueryKey};
use crate::query::{FetchKind, Query, QueryConfig};
use crate::retry::OnlineState;
use crate::state::DataKind;

/// Keyed store of cache entries.
pub struct QueryCache {
    entries: RwLock<HashMap<QueryHash, Arc<Query>, ahash::RandomState>>,
    online: OnlineState,
    // Handed to entries so their gc timers can reach back without keeping
    // the cache alive.
    weak_self: std::sync::Weak<QueryCache>,
}

impl QueryCache {
    pub(crate) fn new(online: OnlineState) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            entries: RwLock::new(HashMap::default()),
            online,
            weak_self: weak_self.clone(),
        })
    }

    /// Look up an entry by key.
    pub fn get(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.entries.read().get(&key.hash_value()).cloned()
    }

    /// Look up an entry, creating it with `config` if absent.
    ///
    /// An existing entry must hold the requested data shape; a single-value
    /// entry and a paged entry never share a key.
    pub(crate) fn get_or_create(
        &self,
        key: &QueryKey,
        kind: DataKind,
        config: impl FnOnce() -> QueryConfig,
    ) -> Result<Arc<Query>, QueryError> {
        let hash = key.hash_value();
        if let Some(existing) = self.entries.read().get(&hash) {
            return Self::check_kind(existing, kind);
        }
        let mut entries = self.entries.write();
        // Racing creators resolve to whoever inserted first.
        if let Some(existing) = entries.get(&hash) {
            return Self::check_kind(existing, kind);
        }
        let query = Query::new(
            self.weak_self.clone(),
            key.clone(),
            kind,
            config(),
            self.online.clone(),
        );
        debug!(key = %key.debug_repr(), %hash, "cache entry created");
        entries.insert(hash, query.clone());
        Ok(query)
    }

    fn check_kind(query: &Arc<Query>, expected: DataKind) -> Result<Arc<Query>, QueryError> {
        if query.kind() == expected {
            Ok(query.clone())
        } else {
            Err(QueryError::KindMismatch {
                expected,
                actual: query.kind(),
            })
        }
    }

    /// Remove an entry unconditionally.
    pub fn remove(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.entries.write().remove(&key.hash_value())
    }

    /// Remove the entry only if it still has no observers. This is the gc
    /// timer's expiry action; an observer attached since arming wins.
    pub(crate) fn remove_if_unused(&self, hash: &QueryHash) {
        let mut entries = self.entries.write();
        if let Some(query) = entries.get(hash) {
            if query.observer_count() == 0 {
                debug!(key = %query.key().debug_repr(), "gc removed unobserved entry");
                entries.remove(hash);
            }
        }
    }

    /// All entries whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &QueryKey) -> Vec<Arc<Query>> {
        self.entries
            .read()
            .values()
            .filter(|query| query.key().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// All entries satisfying an arbitrary predicate.
    pub fn find_matching(&self, predicate: impl Fn(&Query) -> bool) -> Vec<Arc<Query>> {
        self.entries
            .read()
            .values()
            .filter(|query| predicate(query))
            .cloned()
            .collect()
    }

    /// All entries, in no particular order.
    pub fn queries(&self) -> Vec<Arc<Query>> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Mark every entry under `prefix` stale, and refetch the ones that are
    /// actively observed and fetchable. Unobserved entries stay marked and
    /// refetch lazily on next access.
    pub(crate) fn invalidate_prefix(&self, prefix: &QueryKey) {
        let matched = self.find_by_prefix(prefix);
        debug!(prefix = %prefix.debug_repr(), count = matched.len(), "invalidating entries");
        let handle = tokio::runtime::Handle::try_current().ok();
        for query in matched {
            query.invalidate();
            if query.is_active() && query.has_fetcher() {
                if let Some(handle) = &handle {
                    let query = query.clone();
                    handle.spawn(async move {
                        let _ = query.fetch(FetchKind::Refetch).await;
                    });
                }
            }
        }
    }

    /// Drop every entry, cancelling any in-flight fetches.
    pub fn clear(&self) {
        let entries: Vec<Arc<Query>> = {
            let mut entries = self.entries.write();
            debug!(count = entries.len(), "clearing cache");
            entries.drain().map(|(_, query)| query).collect()
        };
        for query in entries {
            query.cancel_fetch();
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .finish()
    }
}
