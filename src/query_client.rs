use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::task::JoinHandle;

use crate::{
    query::{FetchRequest, Query},
    query_cache::QueryCache,
    query_observer::{ListenerKey, QueryObserver},
    DefaultQueryOptions, PageOptions, PagesUpdate, QueryError, QueryKey, QueryOptions,
    QuerySnapshot, QueryValue, Trigger, TriggerSource,
};

/// The cache client. An injectable handle to one isolated query cache;
/// clones share the same cache.
///
/// Queries can be:
/// - Subscribed to ([`query`](Self::query)), returning a [`QueryHandle`].
/// - Prefetched ([`prefetch_query`](Self::prefetch_query)): loaded before
///   anything subscribes.
/// - Invalidated ([`invalidate_query`](Self::invalidate_query)): marked stale
///   and refetched in the background while actively observed.
/// - Introspected ([`peek_snapshot`](Self::peek_snapshot)).
/// - Manually updated ([`set_query_data`](Self::set_query_data)): a local
///   write followed by a reconciling refetch.
#[derive(Clone)]
pub struct QueryClient {
    pub(crate) cache: QueryCache,
    default_options: DefaultQueryOptions,
    triggers: Arc<TriggerRuntime>,
}

struct TriggerRuntime {
    source: Mutex<Option<Arc<dyn TriggerSource>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerRuntime {
    fn is_backgrounded(&self) -> bool {
        self.source
            .lock()
            .expect("trigger source lock")
            .as_ref()
            .map(|source| source.is_backgrounded())
            .unwrap_or(false)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Creates a new client with default options.
    pub fn new() -> Self {
        Self::with_options(DefaultQueryOptions::default())
    }

    /// Creates a new client with custom default options.
    pub fn with_options(default_options: DefaultQueryOptions) -> Self {
        Self {
            cache: QueryCache::new(),
            default_options,
            triggers: Arc::new(TriggerRuntime {
                source: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Query options seeded from this client's defaults.
    pub fn default_options<V, P>(&self) -> QueryOptions<V, P> {
        QueryOptions::with_defaults(&self.default_options)
    }

    /// Subscribe to a query. Registers interest in the entry for `key`,
    /// cancels any pending garbage collection, and, unless the options say
    /// otherwise, ensures fresh data with an initial fetch.
    ///
    /// The entry stays cached for `gc_time` after the returned handle (and
    /// every other handle for the key) is dropped.
    pub fn query<K, V, P, F, Fu>(
        &self,
        key: K,
        fetcher: F,
        options: QueryOptions<V, P>,
    ) -> QueryHandle<K, V, P>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
        F: Fn(K, Option<P>) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let options = options.validate();
        let observer = QueryObserver::with_fetcher(fetcher, options);
        let query = self.cache.subscribe_query(key, &observer);

        let options = observer.options();
        if !options.manual && options.refetch_on_mount && query.is_stale(options.stale_time) {
            query.execute(&observer, false);
        }

        let interval_task = options
            .refetch_interval
            .filter(|_| !options.manual)
            .map(|interval| {
                let query = query.clone();
                let observer = observer.clone();
                let triggers = self.triggers.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        let in_background = !observer.options().refetch_interval_in_background
                            && triggers.is_backgrounded();
                        if in_background {
                            continue;
                        }
                        let _ = query
                            .fetch(
                                observer.fetcher(),
                                observer.options().clone(),
                                FetchRequest::Refetch { force: true },
                            )
                            .await;
                    }
                })
            });

        QueryHandle {
            query,
            observer,
            interval_task,
        }
    }

    /// Fetch a query and store it in cache, without subscribing.
    /// If the entry already exists it is refetched (deduplicated against any
    /// in-flight fetch). Returns the settled snapshot.
    pub async fn fetch_query<K, V, P, F, Fu>(
        &self,
        key: K,
        fetcher: F,
        options: QueryOptions<V, P>,
    ) -> Result<QuerySnapshot<V>, QueryError>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
        F: Fn(K, Option<P>) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let options = options.validate();
        let query = self.cache.get_or_create_query(key, &options);
        let observer = QueryObserver::with_fetcher(fetcher, options);

        query
            .fetch(
                observer.fetcher(),
                observer.options().clone(),
                FetchRequest::Refetch { force: true },
            )
            .await?;

        Ok(query.snapshot())
    }

    /// Prefetch a query in the background and store it in cache.
    ///
    /// If you need the result opt for [`fetch_query`](Self::fetch_query).
    pub fn prefetch_query<K, V, P, F, Fu>(&self, key: K, fetcher: F, options: QueryOptions<V, P>)
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
        F: Fn(K, Option<P>) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let options = options.validate();
        let query = self.cache.get_or_create_query(key, &options);
        let observer = QueryObserver::with_fetcher(fetcher, options);
        query.execute(&observer, true);
    }

    /// Retrieve the current snapshot for an existing entry without
    /// subscribing to it.
    pub fn peek_snapshot<K, V, P>(&self, key: &K) -> Option<QuerySnapshot<V>>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        self.cache
            .get_query::<K, V, P>(key)
            .map(|query| query.snapshot())
    }

    /// Replace an entry's pages synchronously, then trigger a reconciling
    /// refetch. Returns false if no entry exists for the key.
    ///
    /// Never fails on transport: errors of the follow-up refetch follow the
    /// normal retry/error path.
    pub fn set_query_data<K, V, P>(&self, key: &K, update: impl Into<PagesUpdate<V>>) -> bool
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        match self.cache.get_query::<K, V, P>(key) {
            Some(query) => {
                query.mutate(update.into());
                true
            }
            None => false,
        }
    }

    /// Mark an entry stale. While actively observed it refetches immediately
    /// in the background. Returns whether an entry was marked.
    pub fn invalidate_query<K, V, P>(&self, key: &K) -> bool
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        self.cache
            .get_query::<K, V, P>(key)
            .map(|query| query.invalidate())
            .unwrap_or(false)
    }

    /// Mark every cached entry stale.
    pub fn invalidate_all_queries(&self) {
        self.cache.invalidate_all_queries();
    }

    /// Remove an entry from the cache outright, cancelling its timers.
    /// Fails silently (returns false) if absent.
    pub fn evict_query<K, V, P>(&self, key: &K) -> bool
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        self.cache.evict_query::<K, V, P>(key)
    }

    /// Number of cached entries across all key/value types.
    pub fn size(&self) -> usize {
        self.cache.size()
    }

    /// Install the environment trigger source and start reacting to it.
    /// Replaces (and stops) any previously installed source.
    pub fn set_trigger_source(&self, source: Arc<dyn TriggerSource>) {
        *self.triggers.source.lock().expect("trigger source lock") = Some(source.clone());

        let cache = self.cache.clone();
        let driver = tokio::spawn(async move {
            while let Some(trigger) = source.next_trigger().await {
                cache.on_trigger(trigger);
            }
        });

        let mut slot = self.triggers.driver.lock().expect("trigger driver lock");
        if let Some(previous) = slot.replace(driver) {
            previous.abort();
        }
    }

    /// Teardown: stop the trigger driver, cancel all entry timers and drop
    /// every cached entry. In-flight transport calls are not cancelled; they
    /// settle without effect.
    pub fn clear(&self) {
        if let Some(driver) = self.triggers.driver.lock().expect("trigger driver lock").take() {
            driver.abort();
        }
        self.cache.clear();
    }
}

/// Options for [`QueryHandle::refetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RefetchOptions {
    /// Fetch even if the entry is fresh.
    pub force: bool,
    /// Propagate the settled error to the caller instead of only recording it
    /// on the entry.
    pub throw_on_error: bool,
}

/// An active subscription to one query entry.
///
/// Exposes the imperative surface (`refetch`, `fetch_more`, `mutate`) and
/// snapshot access. Dropping the handle detaches this subscriber; it never
/// cancels an in-flight transport call, so other subscribers still benefit
/// from the result.
pub struct QueryHandle<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    query: Query<K, V, P>,
    observer: QueryObserver<K, V, P>,
    interval_task: Option<JoinHandle<()>>,
}

impl<K, V, P> QueryHandle<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    /// The key this handle is bound to.
    pub fn key(&self) -> &K {
        &self.query.key
    }

    /// A consistent, immutable view of the entry right now.
    pub fn snapshot(&self) -> QuerySnapshot<V> {
        self.query.snapshot()
    }

    /// Whether a `fetch_more` would issue a new request.
    pub fn can_fetch_more(&self) -> bool {
        self.snapshot().can_fetch_more
    }

    /// Receive a pushed snapshot after every entry mutation.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QuerySnapshot<V>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.observer.add_listener(listener)
    }

    /// Remove a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.observer.remove_listener(key)
    }

    /// Refetch page 0, discarding accumulated pages on success.
    ///
    /// Attaches to an in-flight fetch if one exists; otherwise no-ops unless
    /// the entry is stale or `force` is set. Resolves when the fetch settles.
    /// Transport errors are recorded on the returned snapshot and only
    /// propagated under `throw_on_error`.
    pub async fn refetch(
        &self,
        options: RefetchOptions,
    ) -> Result<QuerySnapshot<V>, QueryError> {
        let result = self
            .query
            .fetch(
                self.observer.fetcher(),
                self.observer.options().clone(),
                FetchRequest::Refetch {
                    force: options.force,
                },
            )
            .await;

        match result {
            Ok(_) => Ok(self.snapshot()),
            Err(error) if options.throw_on_error => Err(error),
            // Already recorded on the entry and logged by the coordinator.
            Err(_) => Ok(self.snapshot()),
        }
    }

    /// Fetch the next page and append it to the page list.
    ///
    /// No-ops (resolving with the current snapshot) when there is nothing
    /// more to fetch or a fetch is already in flight. `page_options`
    /// overrides the cursor derived from the last page.
    pub async fn fetch_more(
        &self,
        page_options: Option<P>,
    ) -> Result<QuerySnapshot<V>, QueryError> {
        let result = self
            .query
            .fetch(
                self.observer.fetcher(),
                self.observer.options().clone(),
                FetchRequest::FetchMore { page_options },
            )
            .await;

        match result {
            Ok(_) => Ok(self.snapshot()),
            // Transport errors are recorded on the entry; misuse rejects.
            Err(error) if error.is_transport() => Ok(self.snapshot()),
            Err(error) => Err(error),
        }
    }

    /// Replace the page list locally (a literal list or a function of the old
    /// pages), then reconcile with the source of truth via a forced refetch.
    pub fn mutate(&self, update: impl Into<PagesUpdate<V>>) {
        self.query.mutate(update.into());
    }
}

impl<K, V, P> Drop for QueryHandle<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    fn drop(&mut self) {
        if let Some(interval_task) = self.interval_task.take() {
            interval_task.abort();
        }
        self.query.unsubscribe(self.observer.get_id());
    }
}
