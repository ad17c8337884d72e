//! Asynchronous state synchronization for keyed data.
//!
//! `query-sync` caches the results of asynchronous fetches under structured
//! keys and keeps them synchronized: stale data stays visible while a
//! background refetch runs, concurrent fetches for one key deduplicate into
//! a single execution, superseded results are discarded by generation, and
//! unobserved entries are garbage collected after a retention window.
//!
//! The pieces:
//!
//! - [`QueryClient`] — the facade: typed reads/writes, fetching,
//!   invalidation, subscriptions, paged fetching, snapshots.
//! - [`QueryKey`] / [`query_key!`] — structured keys with canonical hashing.
//! - [`QueryState`] — two independent axes per entry: data availability
//!   ([`QueryStatus`]) and execution ([`FetchStatus`]).
//! - [`Observer`] — typed subscriptions with field tracking and structural
//!   sharing.
//! - [`Mutation`] — uncached writes whose settlement drives invalidation.
//! - [`InfinitePages`] — cursor-driven paged entries.
//!
//! # Example
//!
//! ```ignore
//! use query_sync::{fetch_fn, query_key, QueryClient};
//!
//! let client = QueryClient::new();
//! let user = client
//!     .fetch_query::<User>(
//!         &query_key!["users", "detail", 7],
//!         fetch_fn(|ctx| async move { load_user(&ctx.key).await }),
//!     )
//!     .await?;
//! client.invalidate(&query_key!["users"]);
//! ```

mod cache;
mod client;
mod error;
mod infinite;
mod key;
mod mutation;
mod observer;
mod persist;
mod query;
mod retry;
mod state;

pub use cache::QueryCache;
pub use client::{InvalidateOn, QueryClient, QueryClientBuilder, QueryDefaults};
pub use error::QueryError;
pub use infinite::{InfiniteOptions, InfinitePages, NextParamFn, Page};
pub use key::{KeyError, KeyFragment, QueryHash, QueryKey};
pub use mutation::{MutateFn, Mutation, MutationState, MutationStatus};
pub use observer::{Observer, ObserverOptions, QuerySnapshot, TrackedFields};
pub use persist::{CacheSnapshot, Persister, SnapshotEntry};
pub use query::{
    fetch_fn, BehaviorContext, FetchBehavior, FetchContext, FetchFn, FetchFuture, FetchKind,
    Query, QueryConfig,
};
pub use retry::{OnlineState, RetryPolicy};
pub use state::{DataKind, FetchStatus, QueryState, QueryStatus, SharedData, SharedError};
