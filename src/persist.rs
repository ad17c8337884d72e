//! Cache snapshots.
//!
//! A [`CacheSnapshot`] is an in-memory capture of every entry that holds
//! data, with each entry's age at capture time. Restoring rebases the age
//! against the receiving clock, so staleness math keeps working across the
//! handoff. Values stay type-erased and shared; encoding them for durable
//! storage is the [`Persister`] implementor's concern.

use std::time::Duration;

use crate::key::QueryKey;
use crate::state::{DataKind, SharedData};

/// One captured cache entry.
#[derive(Clone)]
pub struct SnapshotEntry {
    /// The entry's key.
    pub key: QueryKey,
    /// The entry's data shape, restored as-is.
    pub kind: DataKind,
    /// The cached value.
    pub data: SharedData,
    /// How old the value was at capture time.
    pub age: Duration,
}

impl std::fmt::Debug for SnapshotEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEntry")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("age", &self.age)
            .finish()
    }
}

/// Point-in-time capture of a cache's data.
#[derive(Clone, Debug, Default)]
pub struct CacheSnapshot {
    /// Captured entries, in no particular order.
    pub entries: Vec<SnapshotEntry>,
}

impl CacheSnapshot {
    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop captured entries not under `prefix`.
    pub fn retain_prefix(&mut self, prefix: &QueryKey) {
        self.entries.retain(|entry| entry.key.starts_with(prefix));
    }
}

/// Storage adapter for snapshots.
///
/// The engine hands over and receives [`CacheSnapshot`]s; serialization of
/// the type-erased values is up to the implementor, which knows the concrete
/// data types it cached.
pub trait Persister: Send + Sync {
    /// Store a snapshot, replacing any previous one.
    fn persist(&self, snapshot: &CacheSnapshot);

    /// Load the stored snapshot, if any.
    fn recover(&self) -> Option<CacheSnapshot>;
}
