mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::Result;
use futures::StreamExt;
use futures::future::try_join_all;
use sluice::prelude::*;

use common::{
    Backend, Cache, Record, advance, cache_key, failing_item_request, item_request, record,
};

#[tokio::test(start_paused = true)]
async fn test_concurrent_queries_share_one_fetch() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let mut responses = Vec::new();
    for _ in 0..5 {
        let outcome = client.query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork),
            None,
        )?;
        assert!(outcome.state.is_loading);
        responses.push(outcome.response.expect("network request"));
    }
    assert_eq!(client.ongoing_count(), 1);

    let results = try_join_all(responses).await?;
    assert_eq!(backend.calls(), 1);
    assert!(results.iter().all(|result| result == &results[0]));
    assert_eq!(results[0].freshness, 1);
    assert_eq!(client.ongoing_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sequential_queries_fetch_again() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let first = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork))
        .await?;
    let second = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork))
        .await?;

    assert_eq!(first.freshness, 1);
    assert_eq!(second.freshness, 2);
    assert_eq!(client.cache().get_data()[&cache_key("1")].freshness, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cache_only_never_fetches() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheOnly), None)?;
    assert!(outcome.response.is_none());
    assert!(!outcome.state.is_loading);
    assert_eq!(outcome.state.data, None);

    let result = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheOnly))
        .await;
    assert_eq!(result, Err(QueryError::NotCached(cache_key("1"))));
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cache_first_fetches_only_when_empty() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let loaded = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheFirst))
        .await?;
    assert_eq!(loaded.freshness, 1);

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheFirst), None)?;
    assert!(outcome.response.is_none());
    assert_eq!(outcome.state.data, Some(loaded));
    assert!(outcome.state.is_success());
    assert_eq!(backend.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_cache_skips_reads_and_writes() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let data = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::NoCache))
        .await?;
    assert_eq!(data.freshness, 1);
    assert!(client.cache().get_data().is_empty());

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::NoCache), None)?;
    assert_eq!(outcome.state.data, None);
    assert!(outcome.response.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_cache_with_on_change_is_usage_error() {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let result = client.query(
        item_request(&backend, "1", 10, FetchPolicy::NoCache),
        Some(Box::new(|_| {})),
    );
    assert!(result.is_err_and(|error| error.is_usage()));

    let result = client.watch(item_request(&backend, "1", 10, FetchPolicy::NoCache));
    assert!(result.is_err_and(|error| error.is_usage()));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_soft_abort_by_one_caller_keeps_request_alive() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();
    let first_leaves = CancelToken::new();
    let second_leaves = CancelToken::new();

    let first = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork)
                .soft_abort(first_leaves.clone()),
            None,
        )?
        .response
        .expect("network request");
    let second = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork)
                .soft_abort(second_leaves.clone()),
            None,
        )?
        .response
        .expect("network request");

    advance(10).await;
    first_leaves.fire();

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first?.freshness, 1);
    assert_eq!(second?.freshness, 1);
    assert_eq!(backend.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_soft_abort_by_every_caller_cancels_request() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();
    let first_leaves = CancelToken::new();
    let second_leaves = CancelToken::new();

    let first = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork)
                .soft_abort(first_leaves.clone()),
            None,
        )?
        .response
        .expect("network request");
    let second = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork)
                .soft_abort(second_leaves.clone()),
            None,
        )?
        .response
        .expect("network request");

    advance(10).await;
    first_leaves.fire();
    second_leaves.fire();

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first, Err(QueryError::Aborted));
    assert_eq!(second, Err(QueryError::Aborted));

    let state = client.read_query(&item_request(&backend, "1", 100, FetchPolicy::CacheOnly));
    assert_eq!(state.data, None);
    assert_eq!(state.error, Some(QueryError::Aborted));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hard_abort_cancels_every_caller() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();
    let abort = CancelToken::new();

    let first = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork).abort(abort.clone()),
            None,
        )?
        .response
        .expect("network request");
    let second = client
        .query(item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork), None)?
        .response
        .expect("network request");

    advance(10).await;
    abort.fire();

    assert_eq!(first.await, Err(QueryError::Aborted));
    assert_eq!(second.await, Err(QueryError::Aborted));
    assert!(!client.is_in_flight(&cache_key("1")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_aborted_request_does_not_accept_new_callers() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();
    let abort = CancelToken::new();

    let aborted = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork).abort(abort.clone()),
            None,
        )?
        .response
        .expect("network request");
    abort.fire();

    let fresh = client
        .query(item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork), None)?
        .response
        .expect("network request");

    assert_eq!(aborted.await, Err(QueryError::Aborted));
    let data = fresh.await?;
    assert_eq!(data.value, "stored");

    // The aborted request was superseded, so its error never reached the cache.
    let state = client.read_query(&item_request(&backend, "1", 100, FetchPolicy::CacheOnly));
    assert_eq!(state.error, None);
    assert_eq!(state.data, Some(data));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_purge_mid_flight_leaves_cache_empty() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let response = client
        .query(item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork), None)?
        .response
        .expect("network request");
    advance(10).await;
    assert_eq!(backend.calls(), 1);

    client.purge();
    assert_eq!(client.ongoing_count(), 0);
    assert_eq!(response.await, Err(QueryError::Aborted));

    let state = client.read_query(&item_request(&backend, "1", 100, FetchPolicy::CacheOnly));
    assert_eq!(state.data, None);
    assert_eq!(state.error, None);

    // The client stays usable after a purge.
    let data = client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheFirst))
        .await?;
    assert_eq!(data.freshness, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_force_request_on_merge_reruns() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let first = client
        .query(item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork), None)?
        .response
        .expect("network request");
    advance(10).await;
    assert_eq!(backend.calls(), 1);

    let second = client
        .query(
            item_request(&backend, "1", 100, FetchPolicy::CacheAndNetwork).force_request_on_merge(true),
            None,
        )?
        .response
        .expect("network request");

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first?.freshness, 2);
    assert_eq!(second?.freshness, 2);
    assert_eq!(backend.calls(), 2);
    assert_eq!(client.cache().get_data()[&cache_key("1")].freshness, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_network_error_is_cached_and_cleared() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let result = client.fetch_query(failing_item_request(&backend, "1", 10)).await;
    let expected = QueryError::Network("1 unavailable".to_string());
    assert_eq!(result, Err(expected.clone()));

    let state = client.read_query(&item_request(&backend, "1", 10, FetchPolicy::CacheOnly));
    assert!(state.is_error());
    assert_eq!(state.error, Some(expected));

    client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork))
        .await?;
    let state = client.read_query(&item_request(&backend, "1", 10, FetchPolicy::CacheOnly));
    assert!(state.is_success());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_on_change_reports_settled_state() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();
    let seen: Arc<Mutex<Vec<QueryState<common::Record>>>> = Arc::default();

    let sink = seen.clone();
    let outcome = client.query(
        item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork),
        Some(Box::new(move |state| sink.lock().expect("seen lock").push(state))),
    )?;
    let subscription = outcome.subscription.expect("subscription");
    let data = outcome.response.expect("network request").await?;

    {
        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, Some(data));
        assert!(!seen[0].is_loading);
    }

    // Unrelated writes do not change this request's data.
    client
        .fetch_query(item_request(&backend, "2", 10, FetchPolicy::CacheAndNetwork))
        .await?;
    assert_eq!(seen.lock().expect("seen lock").len(), 1);

    subscription.unsubscribe();
    client
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork))
        .await?;
    assert_eq!(seen.lock().expect("seen lock").len(), 1);
    assert_eq!(client.cache().subscriber_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_watch_streams_states() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let mut states = client.watch(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork))?;

    let initial = states.next().await.expect("initial state");
    assert!(initial.is_loading);
    assert_eq!(initial.data, None);

    let loaded = states.next().await.expect("loaded state");
    assert!(!loaded.is_loading);
    assert_eq!(loaded.data.map(|data| data.freshness), Some(1));

    drop(states);
    assert_eq!(client.cache().subscriber_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_pass_fetches_only_missing_data() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::with_config(ClientConfig::server());

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    outcome.response.expect("network request").await?;

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    assert!(outcome.response.is_none());
    assert!(outcome.state.data.is_some());

    let outcome = client.query(item_request(&backend, "2", 10, FetchPolicy::NoCache), None)?;
    assert!(outcome.response.is_none());
    assert_eq!(backend.calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_pass_with_ssr_disabled_never_fetches() -> Result<()> {
    let backend = Backend::new();
    let client = Client::<Cache>::with_config(ClientConfig::server().with_disable_ssr(true));

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    assert!(outcome.response.is_none());
    assert!(!outcome.state.is_loading);
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hydrated_cache_skips_network_until_complete() -> Result<()> {
    let backend = Backend::new();

    // Fill a cache on a server pass and ship it as JSON.
    let server = Client::<Cache>::with_config(ClientConfig::server());
    server
        .fetch_query(item_request(&backend, "1", 10, FetchPolicy::CacheFirst))
        .await?;
    let payload = serde_json::to_string(&server.cache().extract())?;

    let snapshot: CacheSnapshot<Cache> = serde_json::from_str(&payload)?;
    let client = Client::with_snapshot(ClientConfig::default(), snapshot);
    assert!(client.is_hydrating());

    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    assert!(outcome.response.is_none());
    assert_eq!(outcome.state.data.map(|data| data.freshness), Some(1));

    // Requests with nothing cached still go to the network.
    let outcome = client.query(item_request(&backend, "2", 10, FetchPolicy::CacheAndNetwork), None)?;
    outcome.response.expect("network request").await?;

    client.on_hydrate_complete();
    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    assert_eq!(outcome.response.expect("network request").await?.freshness, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hydration_optimization_can_be_disabled() -> Result<()> {
    let backend = Backend::new();
    let mut data = Cache::new();
    data.insert(cache_key("1"), record("1", "shipped"));
    let snapshot = CacheSnapshot {
        data,
        errors: Default::default(),
    };

    let client = Client::with_snapshot(
        ClientConfig::default().with_optimize_on_hydrate(false),
        snapshot,
    );
    let outcome = client.query(item_request(&backend, "1", 10, FetchPolicy::CacheAndNetwork), None)?;
    assert_eq!(outcome.state.data.map(|data| data.value), Some("shipped".to_string()));
    assert!(outcome.response.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_never_emits_stale_state_under_concurrent_writes() -> Result<()> {
    const WRITES: usize = 200;
    let backend = Backend::new();
    let client = Client::<Cache>::new();

    let writer = client.clone();
    let writes = tokio::spawn(async move {
        for freshness in 1..=WRITES {
            writer.cache().update(CacheUpdate::new().data(move |data: &Cache| {
                let mut next = data.clone();
                next.insert(
                    cache_key("1"),
                    Record {
                        freshness,
                        ..record("1", "written")
                    },
                );
                next
            }));
            tokio::task::yield_now().await;
        }
    });

    let mut states = client.watch(item_request(&backend, "1", 10, FetchPolicy::CacheOnly))?;
    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        while let Some(state) = states.next().await {
            let freshness = state.data.map_or(0, |data| data.freshness);
            seen.push(freshness);
            if freshness == WRITES {
                break;
            }
        }
        seen
    })
    .await?;
    writes.await?;

    assert_eq!(seen.last(), Some(&WRITES));
    assert!(
        seen.windows(2).all(|pair| pair[0] < pair[1]),
        "states arrived out of order: {seen:?}"
    );
    assert_eq!(backend.calls(), 0);
    Ok(())
}
