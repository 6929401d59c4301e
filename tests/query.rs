use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use infinite_query::{
    QueryClient, QueryError, QueryOptions, QueryStatus, RefetchOptions, RetryDelay, RetryPolicy,
    Trigger, TriggerSource,
};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key(&'static str);

#[derive(Debug, Clone, PartialEq)]
struct Page {
    items: Vec<u32>,
    next: Option<u32>,
}

const FETCH_LATENCY: Duration = Duration::from_millis(50);

/// A fetcher serving two pages: offsets 0.. and 2.., the second one final.
fn paged_fetcher(
    calls: Arc<AtomicUsize>,
) -> impl Fn(Key, Option<u32>) -> futures::future::BoxFuture<'static, Result<Page, QueryError>>
       + Send
       + Sync
       + 'static {
    move |_key, offset| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(FETCH_LATENCY).await;
            match offset.unwrap_or(0) {
                0 => Ok(Page {
                    items: vec![1, 2],
                    next: Some(2),
                }),
                _ => Ok(Page {
                    items: vec![3],
                    next: None,
                }),
            }
        })
    }
}

fn paged_options() -> QueryOptions<Page, u32> {
    QueryOptions::default()
        .set_get_fetch_more(|last: &Page, _all: &[Page]| last.next)
        .set_manual(true)
}

fn fast_retry() -> RetryDelay {
    RetryDelay::Custom(Arc::new(|_| Duration::from_millis(10)))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_refetches_share_one_transport_call() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("dedup"), paged_fetcher(calls.clone()), paged_options());

    let force = RefetchOptions {
        force: true,
        ..Default::default()
    };
    let (a, b) = tokio::join!(handle.refetch(force), handle.refetch(force));

    let a = a.expect("first refetch");
    let b = b.expect("second refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.pages, b.pages);
    assert_eq!(a.pages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_more_appends_without_altering_prior_pages() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("pages"), paged_fetcher(calls.clone()), paged_options());

    let first = handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("first fetch");
    assert_eq!(first.pages.len(), 1);
    assert_eq!(first.pages[0].items, vec![1, 2]);
    assert!(first.can_fetch_more);

    let second = handle.fetch_more(None).await.expect("fetch more");
    assert_eq!(second.pages.len(), 2);
    assert_eq!(second.pages[0], first.pages[0]);
    assert_eq!(second.pages[1].items, vec![3]);
    assert!(!second.can_fetch_more);

    // Exhausted: further fetch_more calls are no-ops.
    let third = handle.fetch_more(None).await.expect("noop fetch more");
    assert_eq!(third.pages.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A plain refetch resets the accumulation and reopens the cursor.
    let reset = handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("reset refetch");
    assert_eq!(reset.pages.len(), 1);
    assert!(reset.can_fetch_more);
}

#[tokio::test(start_paused = true)]
async fn fetch_more_without_fetch_more_fn_is_a_configuration_error() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options: QueryOptions<Page, u32> = QueryOptions::default().set_manual(true);
    let handle = client.query(Key("no-fn"), paged_fetcher(calls), options);

    let result = handle.fetch_more(Some(2)).await;
    assert!(matches!(result, Err(QueryError::Configuration(_))));
}

#[tokio::test(start_paused = true)]
async fn retry_limit_bounds_the_attempt_count() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move |_key: Key, _offset: Option<u32>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Page, _>(QueryError::transport_msg("unreachable host"))
            }
        }
    };
    let options = paged_options()
        .set_retry(RetryPolicy::Limit(3))
        .set_retry_delay(fast_retry());
    let handle = client.query(Key("retries"), fetcher, options);

    let result = handle
        .refetch(RefetchOptions {
            force: true,
            throw_on_error: true,
        })
        .await;

    assert!(matches!(result, Err(QueryError::Transport(_))));
    // 1 initial attempt + 3 retries, no 5th.
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert_eq!(snapshot.failure_count, 4);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn retry_never_fails_after_the_first_attempt() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move |_key: Key, _offset: Option<u32>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Page, _>(QueryError::transport_msg("boom"))
            }
        }
    };
    let options = paged_options().set_retry(RetryPolicy::Never);
    let handle = client.query(Key("no-retry"), fetcher, options);

    // Without throw_on_error the error is only recorded on the snapshot.
    let snapshot = handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("swallowed error");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert_eq!(snapshot.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn failure_count_resets_on_success() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move |_key: Key, _offset: Option<u32>| {
            let calls = calls.clone();
            async move {
                // First attempt fails, the retry succeeds.
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(QueryError::transport_msg("flaky"))
                } else {
                    Ok(Page {
                        items: vec![1],
                        next: None,
                    })
                }
            }
        }
    };
    let options = paged_options()
        .set_retry(RetryPolicy::Limit(3))
        .set_retry_delay(fast_retry());
    let handle = client.query(Key("flaky"), fetcher, options);

    let snapshot = handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("refetch");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.status, QueryStatus::Success);
    assert_eq!(snapshot.failure_count, 0);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn zero_stale_time_always_refetches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options()
        .set_manual(false)
        .set_stale_time(Some(Duration::ZERO));
    let handle = client.query(Key("stale"), paged_fetcher(calls.clone()), options);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "mount fetch");

    handle
        .refetch(RefetchOptions::default())
        .await
        .expect("unforced refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn infinite_stale_time_never_refetches_automatically() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options().set_manual(false).set_stale_time(None);
    let handle = client.query(Key("fresh"), paged_fetcher(calls.clone()), options);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "mount fetch");

    let snapshot = handle
        .refetch(RefetchOptions::default())
        .await
        .expect("unforced refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "entry never goes stale");
    assert_eq!(snapshot.status, QueryStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn gc_removes_entry_after_cache_time_of_disuse() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options().set_gc_time(Some(Duration::from_millis(1000)));
    let handle = client.query(Key("gc"), paged_fetcher(calls.clone()), options);
    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("fill cache");
    assert_eq!(client.size(), 1);

    drop(handle);
    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(client.size(), 1, "gc timer has not elapsed yet");

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(client.size(), 0, "entry collected after cache_time");
}

#[tokio::test(start_paused = true)]
async fn resubscribing_cancels_pending_gc() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = || {
        paged_options()
            .set_gc_time(Some(Duration::from_millis(1000)))
            .set_stale_time(None)
    };
    let handle = client.query(Key("gc-cancel"), paged_fetcher(calls.clone()), options());
    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("fill cache");

    drop(handle);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // New subscriber within cache_time keeps the entry (and its data) alive.
    let handle = client.query(Key("gc-cancel"), paged_fetcher(calls.clone()), options());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.size(), 1);
    assert_eq!(handle.snapshot().pages.len(), 1, "cached pages survived");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh entry was not refetched");
}

#[tokio::test(start_paused = true)]
async fn mutate_writes_locally_then_reconciles() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("mutate"), paged_fetcher(calls.clone()), paged_options());
    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("first fetch");

    handle.mutate(vec![Page {
        items: vec![9, 9, 9],
        next: None,
    }]);

    // The local write is visible synchronously.
    let local = handle.snapshot();
    assert_eq!(local.status, QueryStatus::Success);
    assert_eq!(local.pages[0].items, vec![9, 9, 9]);

    // The reconciling refetch replaces it with the source of truth.
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.snapshot().pages[0].items, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn initial_data_seeds_the_entry_without_fetching() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options()
        .set_manual(false)
        .set_stale_time(None)
        .set_initial_data(Some(vec![Page {
            items: vec![7],
            next: Some(1),
        }]));
    let handle = client.query(Key("seeded"), paged_fetcher(calls.clone()), options);

    settle().await;
    let snapshot = handle.snapshot();
    assert_eq!(calls.load(Ordering::SeqCst), 0, "seeded entry is fresh");
    assert_eq!(snapshot.status, QueryStatus::Success);
    assert_eq!(snapshot.pages[0].items, vec![7]);
    assert!(snapshot.can_fetch_more, "cursor derived from seeded pages");
}

#[tokio::test(start_paused = true)]
async fn listeners_receive_pushed_snapshots() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("listen"), paged_fetcher(calls), paged_options());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = seen.clone();
        move |snapshot: &infinite_query::QuerySnapshot<Page>| {
            seen.lock().unwrap().push(snapshot.status);
        }
    };
    let listener_key = handle.subscribe(listener);

    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("refetch");

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&QueryStatus::Fetching));
    assert_eq!(seen.last(), Some(&QueryStatus::Success));
    assert!(handle.unsubscribe(listener_key));
}

#[tokio::test(start_paused = true)]
async fn invalidation_refetches_actively_observed_entries() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options().set_manual(false).set_stale_time(None);
    let _handle = client.query(Key("invalidate"), paged_fetcher(calls.clone()), options);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(client.invalidate_query::<Key, Page, u32>(&Key("invalidate")));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn fetch_peek_and_evict_round_trip() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = Key("imperative");

    let snapshot = client
        .fetch_query(key.clone(), paged_fetcher(calls.clone()), paged_options())
        .await
        .expect("fetch_query");
    assert_eq!(snapshot.status, QueryStatus::Success);
    assert_eq!(snapshot.pages.len(), 1);

    let peeked = client
        .peek_snapshot::<Key, Page, u32>(&key)
        .expect("cached entry");
    assert_eq!(peeked.pages, snapshot.pages);

    assert!(client.evict_query::<Key, Page, u32>(&key));
    assert!(client.peek_snapshot::<Key, Page, u32>(&key).is_none());
    assert!(!client.evict_query::<Key, Page, u32>(&key));
}

struct TestTriggers {
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Trigger>>,
    backgrounded: AtomicBool,
}

#[async_trait::async_trait]
impl TriggerSource for TestTriggers {
    async fn next_trigger(&self) -> Option<Trigger> {
        self.rx.lock().await.recv().await
    }

    fn is_backgrounded(&self) -> bool {
        self.backgrounded.load(Ordering::SeqCst)
    }
}

#[tokio::test(start_paused = true)]
async fn window_focus_refetches_stale_entries_only() {
    let client = QueryClient::new();
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    client.set_trigger_source(Arc::new(TestTriggers {
        rx: tokio::sync::Mutex::new(rx),
        backgrounded: AtomicBool::new(false),
    }));

    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options()
        .set_manual(false)
        .set_stale_time(Some(Duration::ZERO));
    let _handle = client.query(Key("focus"), paged_fetcher(calls.clone()), options);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tx.send(Trigger::WindowFocus).await.expect("send trigger");
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2, "stale entry refetched on focus");

    // A fresh entry ignores the trigger.
    let fresh_calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options().set_manual(false).set_stale_time(None);
    let _fresh = client.query(Key("focus-fresh"), paged_fetcher(fresh_calls.clone()), options);
    settle().await;
    assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);

    tx.send(Trigger::WindowFocus).await.expect("send trigger");
    settle().await;
    assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn refetch_interval_forces_periodic_refetches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options()
        .set_manual(false)
        .set_stale_time(None)
        .set_refetch_interval(Some(Duration::from_millis(300)));
    let _handle = client.query(Key("interval"), paged_fetcher(calls.clone()), options);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "mount fetch");

    tokio::time::sleep(Duration::from_millis(1000)).await;
    // Interval fires regardless of the infinite stale time.
    assert!(calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test(start_paused = true)]
async fn fetch_more_override_cannot_reopen_exhausted_cursor() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("override"), paged_fetcher(calls.clone()), paged_options());
    let force = RefetchOptions {
        force: true,
        ..Default::default()
    };

    // Before any fetch the cursor is not requested yet; an override is a no-op.
    let fresh = handle.fetch_more(Some(0)).await.expect("noop on fresh entry");
    assert_eq!(fresh.pages.len(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    handle.refetch(force).await.expect("first fetch");
    handle.fetch_more(None).await.expect("fetch more");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!handle.can_fetch_more());

    // Exhausted stays exhausted even when page options are supplied.
    let overridden = handle
        .fetch_more(Some(0))
        .await
        .expect("noop on exhausted cursor");
    assert_eq!(overridden.pages.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Only a full reset reopens the cursor; the override then applies.
    handle.refetch(force).await.expect("reset refetch");
    let replayed = handle
        .fetch_more(Some(0))
        .await
        .expect("fetch more with override");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(replayed.pages[1].items, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn dropped_caller_does_not_cancel_the_shared_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let owner = client.query(Key("shared"), paged_fetcher(calls.clone()), paged_options());
    let follower = client.query(Key("shared"), paged_fetcher(calls.clone()), paged_options());

    let force = RefetchOptions {
        force: true,
        ..Default::default()
    };
    let owner_task = tokio::spawn(async move {
        let _ = owner.refetch(force).await;
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let follower_task = tokio::spawn(async move { follower.refetch(force).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Aborting the initiating caller mid-flight detaches only that caller.
    owner_task.abort();

    let snapshot = follower_task
        .await
        .expect("follower task")
        .expect("follower refetch");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshot.status, QueryStatus::Success);
    assert_eq!(snapshot.pages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_after_gc_creates_a_fresh_entry() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = || paged_options().set_gc_time(Some(Duration::from_millis(1000)));
    let handle = client.query(Key("gc-fresh"), paged_fetcher(calls.clone()), options());
    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("fill cache");

    drop(handle);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(client.size(), 0);

    // The new subscription and the cache map agree on a single entry.
    let handle = client.query(Key("gc-fresh"), paged_fetcher(calls.clone()), options());
    assert_eq!(client.size(), 1);
    let peeked = client
        .peek_snapshot::<Key, Page, u32>(&Key("gc-fresh"))
        .expect("cached entry");
    assert_eq!(peeked.pages.len(), 0, "collected pages are gone");
    assert_eq!(handle.snapshot().pages.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn refetch_interval_pauses_while_backgrounded() {
    let client = QueryClient::new();
    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    let triggers = Arc::new(TestTriggers {
        rx: tokio::sync::Mutex::new(rx),
        backgrounded: AtomicBool::new(true),
    });
    client.set_trigger_source(triggers.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let options = paged_options()
        .set_manual(false)
        .set_stale_time(None)
        .set_refetch_interval(Some(Duration::from_millis(100)));
    let _handle = client.query(Key("background"), paged_fetcher(calls.clone()), options);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "mount fetch");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "interval gated while backgrounded"
    );

    triggers.backgrounded.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        calls.load(Ordering::SeqCst) >= 2,
        "interval resumes in the foreground"
    );
}

#[tokio::test(start_paused = true)]
async fn clear_tears_down_all_entries() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = client.query(Key("teardown"), paged_fetcher(calls.clone()), paged_options());
    handle
        .refetch(RefetchOptions {
            force: true,
            ..Default::default()
        })
        .await
        .expect("fill cache");
    assert_eq!(client.size(), 1);

    client.clear();
    assert_eq!(client.size(), 0);
}
