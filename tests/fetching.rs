//! Fetch mechanics through the client: deduplication, freshness, retry,
//! cancellation and the offline signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use query_sync::{
    fetch_fn, query_key, FetchFn, FetchStatus, QueryClient, QueryError, QueryStatus, RetryPolicy,
};

fn counting(calls: Arc<AtomicU32>, value: i32) -> FetchFn {
    fetch_fn(move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    })
}

fn slow_counting(calls: Arc<AtomicU32>, value: i32, delay: Duration) -> FetchFn {
    fetch_fn(move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_execution() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["users", 1];
    let fetch = slow_counting(calls.clone(), 7, Duration::from_millis(50));

    let (a, b, c) = tokio::join!(
        client.fetch_query::<i32>(&key, fetch.clone()),
        client.fetch_query::<i32>(&key, fetch.clone()),
        client.fetch_query::<i32>(&key, fetch),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*a, 7);
    // Every waiter receives the same shared value.
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
}

#[tokio::test(start_paused = true)]
async fn test_ensure_data_respects_freshness() {
    let client = QueryClient::builder()
        .stale_time(Duration::from_secs(60))
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["users", "list"];
    let fetch = counting(calls.clone(), 1);

    client.ensure_data::<i32>(&key, fetch.clone()).await.unwrap();
    client.ensure_data::<i32>(&key, fetch.clone()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh data is not refetched");

    tokio::time::advance(Duration::from_secs(61)).await;
    client.ensure_data::<i32>(&key, fetch).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "stale data is refetched");
}

#[tokio::test(start_paused = true)]
async fn test_stale_data_stays_visible_during_refetch() {
    let client = QueryClient::new();
    let key = query_key!["profile"];
    let calls = Arc::new(AtomicU32::new(0));

    client
        .fetch_query::<i32>(&key, counting(calls.clone(), 1))
        .await
        .unwrap();

    let slow = slow_counting(calls.clone(), 2, Duration::from_millis(100));
    let background = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move { client.fetch_query::<i32>(&key, slow).await })
    };
    tokio::task::yield_now().await;

    // Mid-refetch: previous data still readable, execution axis fetching.
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 1);
    let state = client.cache().get(&key).unwrap().state();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Fetching);

    let refreshed = background.await.unwrap().unwrap();
    assert_eq!(*refreshed, 2);
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_until_success_with_backoff() {
    let client = QueryClient::builder()
        .retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            jitter: 0.0,
            ..RetryPolicy::default()
        })
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    let fetch = {
        let calls = calls.clone();
        fetch_fn(move |_ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(5i32)
            }
        })
    };

    let data = client
        .fetch_query::<i32>(&query_key!["flaky"], fetch)
        .await
        .unwrap();
    assert_eq!(*data, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "two failures then success");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_keep_stale_data() {
    let client = QueryClient::builder().retry(RetryPolicy::none()).build();
    let key = query_key!["account"];

    client.set_data(&key, 11i32).unwrap();
    let err = client
        .fetch_query::<i32>(
            &key,
            fetch_fn(|_ctx| async { Err::<i32, _>(anyhow::anyhow!("down")) }),
        )
        .await
        .unwrap_err();
    assert!(err.fetch_error().is_some());

    // Error recorded alongside the data, status still success.
    let state = client.cache().get(&key).unwrap().state();
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_some());
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_imperative_write_beats_inflight_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["draft"];

    let slow = slow_counting(calls.clone(), 1, Duration::from_millis(100));
    let pending = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move { client.fetch_query::<i32>(&key, slow).await })
    };
    tokio::task::yield_now().await;

    // Optimistic write while the fetch is in flight.
    client.set_data(&key, 99i32).unwrap();

    let settled = pending.await.unwrap();
    assert!(matches!(settled, Err(QueryError::Cancelled)));

    // The late execution must not overwrite the write, no matter how long
    // we wait.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 99);
}

#[tokio::test(start_paused = true)]
async fn test_replacement_fetch_wins_over_cancelled_predecessor() {
    let client = QueryClient::new();
    let key = query_key!["report"];
    let calls = Arc::new(AtomicU32::new(0));

    // Slow first fetch.
    let pending = {
        let client = client.clone();
        let key = key.clone();
        let slow = slow_counting(calls.clone(), 1, Duration::from_secs(10));
        tokio::spawn(async move { client.fetch_query::<i32>(&key, slow).await })
    };
    tokio::task::yield_now().await;

    // Replace it: cancel, then fetch fresh.
    client.cancel(&key);
    let data = client
        .fetch_query::<i32>(&key, counting(calls.clone(), 2))
        .await
        .unwrap();
    assert_eq!(*data, 2);
    assert!(matches!(pending.await.unwrap(), Err(QueryError::Cancelled)));

    // Long after the first fetch would have resolved, the replacement's
    // result still stands.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_neutral() {
    let client = QueryClient::new();
    let key = query_key!["search"];
    client.set_data(&key, 1i32).unwrap();

    let pending = {
        let client = client.clone();
        let key = key.clone();
        let fetch = slow_counting(Arc::new(AtomicU32::new(0)), 2, Duration::from_secs(5));
        tokio::spawn(async move { client.fetch_query::<i32>(&key, fetch).await })
    };
    tokio::task::yield_now().await;

    client.cancel(&key);
    let settled = pending.await.unwrap();
    assert!(matches!(settled, Err(QueryError::Cancelled)));

    let state = client.cache().get(&key).unwrap().state();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(*client.get_data::<i32>(&key).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_pauses_fetch_until_back_online() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["news"];

    client.set_online(false);
    let pending = {
        let client = client.clone();
        let key = key.clone();
        let fetch = counting(calls.clone(), 3);
        tokio::spawn(async move { client.fetch_query::<i32>(&key, fetch).await })
    };
    tokio::task::yield_now().await;

    let state = client.cache().get(&key).unwrap().state();
    assert_eq!(state.fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no attempt while offline");

    client.set_online(true);
    let data = pending.await.unwrap().unwrap();
    assert_eq!(*data, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_is_fetching_counts_by_prefix() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let slow = slow_counting(calls, 1, Duration::from_millis(100));
    let pending = {
        let client = client.clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            let key_a = query_key!["users", 1];
            let key_b = query_key!["users", 2];
            let key_c = query_key!["posts"];
            tokio::join!(
                client.fetch_query::<i32>(&key_a, slow.clone()),
                client.fetch_query::<i32>(&key_b, slow.clone()),
                client.fetch_query::<i32>(&key_c, slow),
            )
        })
    };
    tokio::task::yield_now().await;

    assert_eq!(client.is_fetching(&query_key!["users"]), 2);
    assert_eq!(client.is_fetching(&query_key![]), 3);

    let _ = pending.await.unwrap();
    assert_eq!(client.is_fetching(&query_key![]), 0);
}
