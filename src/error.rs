//! Error types for cache operations.

use thiserror::Error;

use crate::key::KeyError;
use crate::state::{DataKind, SharedError};

/// Errors surfaced by cache operations.
///
/// Execution errors carry the fetch function's error as a shared
/// [`anyhow::Error`] so every waiter of a deduplicated fetch sees the same
/// value. A settled execution whose generation has been superseded is never
/// surfaced at all; its waiters observe [`QueryError::Cancelled`].
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The supplied fetch function rejected and the retry budget is spent.
    #[error("fetch failed: {0}")]
    Fetch(SharedError),

    /// The execution was cancelled (or superseded). Not a failure: cached
    /// data and status are untouched.
    #[error("fetch cancelled")]
    Cancelled,

    /// Malformed key. Synchronous, never retried.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Cached data is not of the requested type.
    #[error("cached data is not a {expected}")]
    TypeMismatch {
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// The entry holds the other data shape (single value vs. page list).
    /// Single-value and paged caches must not share a key.
    #[error("cache entry holds {actual:?} data, expected {expected:?}")]
    KindMismatch {
        /// Shape required by the calling surface.
        expected: DataKind,
        /// Shape the entry was created with.
        actual: DataKind,
    },

    /// A fetch was requested for an entry that has never been given a fetch
    /// function.
    #[error("no fetch function registered for this key")]
    MissingFetchFn,
}

impl QueryError {
    /// Returns the underlying execution error, if any.
    pub fn fetch_error(&self) -> Option<&SharedError> {
        match self {
            QueryError::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the execution error to a concrete type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.fetch_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Whether this is a neutral cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}
