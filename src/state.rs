//! Per-entry state: the two independent axes of a cached query.
//!
//! `status` tracks data availability (`Pending`/`Success`/`Error`) while
//! `fetch_status` tracks execution (`Idle`/`Fetching`/`Paused`). A query can
//! be `Success` and `Fetching` at the same time (background refetch), but
//! never `Pending` and `Success`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
// Timestamps use the tokio clock so freshness and retention windows follow
// time control in tests.
use tokio::time::Instant;

/// Type-erased cached value, shared between the cache and its readers.
pub type SharedData = Arc<dyn Any + Send + Sync>;

/// Shared execution error, as produced by a fetch or mutate function.
pub type SharedError = Arc<anyhow::Error>;

/// Data-availability axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data has ever been received.
    Pending,
    /// Data is available (possibly stale, possibly alongside an error).
    Success,
    /// The last fetch failed and there is no data to fall back on.
    Error,
}

/// Execution axis, independent from [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// No execution in flight.
    Idle,
    /// An execution is in flight.
    Fetching,
    /// An execution is waiting for the network context to come back.
    Paused,
}

/// Shape of the data a cache entry holds.
///
/// A single-value entry and a paged entry must never share a key; the kind is
/// fixed when the entry is created and mismatching access fails fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    /// One value per entry.
    Single,
    /// An ordered page list ([`crate::InfinitePages`]).
    Pages,
}

/// Observable state of one cache entry.
#[derive(Clone)]
pub struct QueryState {
    /// Data-availability axis.
    pub status: QueryStatus,
    /// Execution axis.
    pub fetch_status: FetchStatus,
    /// Last successfully fetched (or imperatively written) value.
    pub data: Option<SharedData>,
    /// Error from the last exhausted fetch, kept alongside stale data.
    pub error: Option<SharedError>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Consecutive failures of the current/last fetch.
    pub fetch_failure_count: u32,
    /// Set by invalidation; forces the next staleness check to report stale.
    pub is_invalidated: bool,
}

impl Default for QueryState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryState {
    /// Fresh entry with no data and no execution.
    pub fn new() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }

    /// Whether cached data exists and is older than `stale_time` (or the
    /// entry has been invalidated). Entries without data are always stale.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            Some(at) => at.elapsed() >= stale_time,
            None => true,
        }
    }

    pub(crate) fn on_fetch_start(&mut self) {
        self.fetch_status = FetchStatus::Fetching;
        self.fetch_failure_count = 0;
    }

    pub(crate) fn on_fetch_pause(&mut self) {
        self.fetch_status = FetchStatus::Paused;
    }

    pub(crate) fn on_fetch_resume(&mut self) {
        self.fetch_status = FetchStatus::Fetching;
    }

    pub(crate) fn on_failure(&mut self) {
        self.fetch_failure_count += 1;
    }

    pub(crate) fn on_success(&mut self, data: SharedData, now: Instant) {
        self.status = QueryStatus::Success;
        self.fetch_status = FetchStatus::Idle;
        self.data = Some(data);
        self.data_updated_at = Some(now);
        self.error = None;
        self.error_updated_at = None;
        self.fetch_failure_count = 0;
        self.is_invalidated = false;
    }

    /// Retries exhausted. Stale data, when present, stays visible: the status
    /// only flips to `Error` if there is nothing to display.
    pub(crate) fn on_error(&mut self, error: SharedError, now: Instant) {
        if self.data.is_none() {
            self.status = QueryStatus::Error;
        }
        self.fetch_status = FetchStatus::Idle;
        self.error = Some(error);
        self.error_updated_at = Some(now);
    }

    /// Cancellation is neutral: the execution axis resets, data and status
    /// are untouched.
    pub(crate) fn on_cancel(&mut self) {
        self.fetch_status = FetchStatus::Idle;
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: i32) -> SharedData {
        Arc::new(n)
    }

    #[test]
    fn test_new_state_is_pending_idle() {
        let state = QueryState::new();
        assert_eq!(state.status, QueryStatus::Pending);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert!(state.data.is_none());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_success_clears_error_and_invalidation() {
        let mut state = QueryState::new();
        state.on_fetch_start();
        state.on_error(Arc::new(anyhow::anyhow!("boom")), Instant::now());
        state.is_invalidated = true;

        state.on_success(value(1), Instant::now());
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert!(state.error.is_none());
        assert!(!state.is_invalidated);
    }

    #[test]
    fn test_error_without_data_flips_status() {
        let mut state = QueryState::new();
        state.on_fetch_start();
        state.on_error(Arc::new(anyhow::anyhow!("boom")), Instant::now());
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.error.is_some());
    }

    #[test]
    fn test_error_with_data_keeps_success() {
        let mut state = QueryState::new();
        state.on_success(value(1), Instant::now());
        state.on_fetch_start();
        state.on_error(Arc::new(anyhow::anyhow!("refresh failed")), Instant::now());

        // Stale-while-revalidate-with-error: data stays visible.
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.data.is_some());
        assert!(state.error.is_some());
    }

    #[test]
    fn test_cancel_only_resets_execution_axis() {
        let mut state = QueryState::new();
        state.on_success(value(1), Instant::now());
        state.on_fetch_start();
        state.on_cancel();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert!(state.data.is_some());
    }

    #[test]
    fn test_staleness() {
        let mut state = QueryState::new();
        assert!(state.is_stale(Duration::from_secs(60)));

        state.on_success(value(1), Instant::now());
        assert!(!state.is_stale(Duration::from_secs(60)));
        assert!(state.is_stale(Duration::ZERO));

        state.is_invalidated = true;
        assert!(state.is_stale(Duration::from_secs(60)));
    }
}
