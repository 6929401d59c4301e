use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_channel::oneshot;

use crate::{
    garbage_collector::GarbageCollector,
    pagination::{cursor_for, merge_page, FetchMoreFn, MergeMode},
    query_observer::{Fetcher, ObserverKey, QueryObserver},
    query_state::{PageCursor, PagesUpdate},
    util::time_until_stale,
    Instant, PageOptions, QueryError, QueryKey, QueryOptions, QuerySnapshot, QueryStatus,
    QueryValue, Trigger,
};

/// A fetch settles with either the merged page list or the final error.
type FetchOutcome<V> = Result<Arc<Vec<V>>, QueryError>;

/// One cache entry: the state machine for a single key.
///
/// All entry state lives behind one mutex which is never held across an await,
/// so the claim of a new fetch (status transition plus in-flight registration)
/// is atomic with respect to concurrent `refetch`/`fetch_more` calls.
pub(crate) struct Query<K, V, P> {
    pub(crate) key: K,

    state: Arc<Mutex<EntryState<V, P>>>,

    // Synchronization
    observers: Arc<Mutex<HashMap<ObserverKey, QueryObserver<K, V, P>>>>,
    garbage_collector: Arc<GarbageCollector>,
    evict: Arc<dyn Fn() + Send + Sync>,
}

impl<K: Clone, V, P> Clone for Query<K, V, P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
            observers: self.observers.clone(),
            garbage_collector: self.garbage_collector.clone(),
            evict: self.evict.clone(),
        }
    }
}

impl<K: PartialEq + Clone, V, P> PartialEq for Query<K, V, P> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: PartialEq + Clone, V, P> Eq for Query<K, V, P> {}

struct EntryState<V, P> {
    status: QueryStatus,
    pages: Arc<Vec<V>>,
    cursor: PageCursor<P>,
    failure_count: u32,
    last_error: Option<QueryError>,
    updated_at: Option<Instant>,
    invalidated: bool,
    /// `Some` while a fetch is in flight. Requests that arrive meanwhile park
    /// a sender here and settle with the in-flight fetch's outcome.
    waiters: Option<Vec<oneshot::Sender<FetchOutcome<V>>>>,
}

impl<V, P> EntryState<V, P> {
    fn new() -> Self {
        Self {
            status: QueryStatus::Idle,
            pages: Arc::new(Vec::new()),
            cursor: PageCursor::NotRequested,
            failure_count: 0,
            last_error: None,
            updated_at: None,
            invalidated: false,
            waiters: None,
        }
    }

    fn needs_fetch(&self, stale_time: Option<Duration>) -> bool {
        if self.invalidated {
            return true;
        }
        match (self.updated_at, stale_time) {
            // Nothing fetched yet.
            (None, _) => true,
            (Some(updated_at), Some(stale_time)) => {
                time_until_stale(updated_at, stale_time).is_zero()
            }
            // Infinite stale time.
            (Some(_), None) => false,
        }
    }
}

/// What a caller asked the coordinator to do.
pub(crate) enum FetchRequest<P> {
    Refetch { force: bool },
    FetchMore { page_options: Option<P> },
}

struct OwnerGuard<'a, K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    query: &'a Query<K, V, P>,
    armed: bool,
}

impl<K, V, P> OwnerGuard<'_, K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K, V, P> Drop for OwnerGuard<'_, K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.query.abandon();
        }
    }
}

/// Resolved role of a call after the claim.
enum Role<V, P> {
    /// This call owns the transport invocation.
    Owner {
        page_options: Option<P>,
        mode: MergeMode,
    },
    /// Another call is in flight; settle with its outcome.
    Follower(oneshot::Receiver<FetchOutcome<V>>),
    /// Nothing to do; resolve immediately with the current pages.
    Resolved(Arc<Vec<V>>),
}

impl<K, V, P> Query<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    pub(crate) fn new(key: K, gc_time: Option<Duration>, evict: Arc<dyn Fn() + Send + Sync>) -> Self {
        Query {
            key,
            state: Arc::new(Mutex::new(EntryState::new())),
            observers: Arc::new(Mutex::new(HashMap::new())),
            garbage_collector: Arc::new(GarbageCollector::new(gc_time)),
            evict,
        }
    }

    /// Seed a freshly created entry with externally supplied pages.
    pub(crate) fn seed(&self, pages: Vec<V>, get_fetch_more: Option<&FetchMoreFn<V, P>>) {
        let mut state = self.state.lock().expect("query state lock");
        if state.status != QueryStatus::Idle || !state.pages.is_empty() {
            return;
        }
        state.cursor = cursor_for(&pages, get_fetch_more);
        state.pages = Arc::new(pages);
        state.status = QueryStatus::Success;
        state.updated_at = Some(Instant::now());
    }

    pub(crate) fn snapshot(&self) -> QuerySnapshot<V> {
        let state = self.state.lock().expect("query state lock");
        QuerySnapshot {
            pages: state.pages.clone(),
            status: state.status,
            failure_count: state.failure_count,
            can_fetch_more: state.cursor.can_fetch_more(),
            last_error: state.last_error.clone(),
            updated_at: state.updated_at,
        }
    }

    pub(crate) fn is_stale(&self, stale_time: Option<Duration>) -> bool {
        self.state
            .lock()
            .expect("query state lock")
            .needs_fetch(stale_time)
    }

    /// Push the current snapshot to every listener of every observer.
    /// No lock is held while listeners run.
    fn notify(&self) {
        let snapshot = self.snapshot();
        let observers: Vec<_> = self
            .observers
            .lock()
            .expect("observers lock")
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer.notify(&snapshot);
        }
    }

    /*
     * Subscription.
     */

    pub(crate) fn subscribe(&self, observer: &QueryObserver<K, V, P>) {
        self.garbage_collector
            .update_gc_time(observer.options().gc_time);
        self.garbage_collector.disable_gc();
        self.observers
            .lock()
            .expect("subscribe observers lock")
            .insert(observer.get_id(), observer.clone());
    }

    pub(crate) fn unsubscribe(&self, id: ObserverKey) {
        let mut observers = self.observers.lock().expect("unsubscribe observers lock");
        if observers.remove(&id).is_some() && observers.is_empty() {
            drop(observers);
            let evict = self.evict.clone();
            self.garbage_collector.enable_gc(move || evict());
        }
    }

    pub(crate) fn has_observers(&self) -> bool {
        !self.observers.lock().expect("observers lock").is_empty()
    }

    fn first_observer(&self) -> Option<QueryObserver<K, V, P>> {
        self.observers
            .lock()
            .expect("observers lock")
            .values()
            .next()
            .cloned()
    }

    /*
     * Imperative entry mutation.
     */

    /// Replace the page list locally, then reconcile with the source of truth
    /// through a forced background refetch. Never fails on transport: refetch
    /// errors follow the normal fetch path.
    pub(crate) fn mutate(&self, update: PagesUpdate<V>) {
        let observer = self.first_observer();
        {
            let mut state = self.state.lock().expect("query state lock");
            let pages = match update {
                PagesUpdate::Set(pages) => pages,
                PagesUpdate::Map(update) => update(&state.pages),
            };
            let get_fetch_more = observer
                .as_ref()
                .and_then(|o| o.options().get_fetch_more.as_ref());
            state.cursor = cursor_for(&pages, get_fetch_more);
            state.pages = Arc::new(pages);
            state.status = QueryStatus::Success;
            state.updated_at = Some(Instant::now());
            state.failure_count = 0;
            state.last_error = None;
        }
        self.notify();

        match observer {
            Some(observer) => self.execute(&observer, true),
            None => tracing::debug!(key = ?self.key, "mutated entry has no observer; skipping reconciling refetch"),
        }
    }

    /// Mark the entry stale immediately. Actively observed entries refetch in
    /// the background. Returns whether anything was marked.
    pub(crate) fn invalidate(&self) -> bool {
        let marked = {
            let mut state = self.state.lock().expect("query state lock");
            if state.updated_at.is_some() && !state.invalidated {
                state.invalidated = true;
                true
            } else {
                false
            }
        };
        if marked {
            if let Some(observer) = self.first_observer() {
                self.execute(&observer, false);
            }
        }
        marked
    }

    /// React to an abstract environment trigger with a staleness-gated refetch.
    pub(crate) fn handle_trigger(&self, trigger: Trigger) {
        let observer = {
            let observers = self.observers.lock().expect("observers lock");
            observers
                .values()
                .find(|observer| {
                    let options = observer.options();
                    match trigger {
                        Trigger::WindowFocus => !options.manual && options.refetch_on_window_focus,
                        Trigger::Poll => !options.manual,
                    }
                })
                .cloned()
        };
        if let Some(observer) = observer {
            self.execute(&observer, false);
        }
    }

    /*
     * Execution.
     */

    /// Fire-and-forget refetch of page 0 with the given observer's query
    /// function and options.
    pub(crate) fn execute(&self, observer: &QueryObserver<K, V, P>, force: bool) {
        let query = self.clone();
        let fetcher = observer.fetcher();
        let options = observer.options().clone();
        tokio::spawn(async move {
            let _ = query
                .fetch(fetcher, options, FetchRequest::Refetch { force })
                .await;
        });
    }

    /// The fetch coordinator. Ensures at most one transport call per entry
    /// runs concurrently; everything else attaches as a follower or resolves
    /// immediately.
    ///
    /// The transport call itself runs in its own task, so a caller dropping
    /// this future detaches only that caller, never the shared fetch.
    pub(crate) async fn fetch(
        &self,
        fetcher: Fetcher<K, V, P>,
        options: QueryOptions<V, P>,
        request: FetchRequest<P>,
    ) -> FetchOutcome<V> {
        let role = self.claim(&options, request)?;

        let receiver = match role {
            Role::Resolved(pages) => return Ok(pages),
            Role::Follower(receiver) => receiver,
            Role::Owner { page_options, mode } => {
                let receiver = self.park_waiter();
                let query = self.clone();
                tokio::spawn(async move {
                    query.run_fetch(fetcher, options, page_options, mode).await;
                });
                receiver
            }
        };

        receiver.await.unwrap_or_else(|_canceled| {
            Err(QueryError::state(
                "query was torn down while a fetch was in flight",
            ))
        })
    }

    /// Park a sender on the in-flight fetch and return its receiver.
    fn park_waiter(&self) -> oneshot::Receiver<FetchOutcome<V>> {
        let (sender, receiver) = oneshot::channel();
        self.state
            .lock()
            .expect("query state lock")
            .waiters
            .get_or_insert_with(Vec::new)
            .push(sender);
        receiver
    }

    /// Owner loop: drives the transport call and its retries, then settles the
    /// entry and every parked waiter.
    async fn run_fetch(
        &self,
        fetcher: Fetcher<K, V, P>,
        options: QueryOptions<V, P>,
        page_options: Option<P>,
        mode: MergeMode,
    ) {
        // If this task is dropped before settling (runtime shutdown), the
        // claim must be released or the entry would refuse new fetches forever.
        let mut guard = OwnerGuard {
            query: self,
            armed: true,
        };

        // Status just transitioned to Fetching/FetchingMore.
        self.notify();

        loop {
            match fetcher(self.key.clone(), page_options.clone()).await {
                Ok(page) => {
                    guard.disarm();
                    self.settle_success(page, mode, &options);
                    return;
                }
                Err(error) => {
                    let failure_count = {
                        let mut state = self.state.lock().expect("query state lock");
                        state.failure_count += 1;
                        state.last_error = Some(error.clone());
                        state.failure_count
                    };
                    self.notify();

                    if options.retry.should_retry(failure_count, &error) {
                        let delay = options.retry_delay.delay(failure_count);
                        tracing::debug!(
                            key = ?self.key,
                            failure_count,
                            delay_ms = delay.as_millis() as u64,
                            "fetch attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    guard.disarm();
                    self.settle_error(error, &options);
                    return;
                }
            }
        }
    }

    /// Atomically decide this call's role. Exactly one concurrent caller can
    /// become the owner.
    fn claim(
        &self,
        options: &QueryOptions<V, P>,
        request: FetchRequest<P>,
    ) -> Result<Role<V, P>, QueryError> {
        let mut state = self.state.lock().expect("query state lock");
        let role = match request {
            FetchRequest::Refetch { force } => {
                if let Some(waiters) = &mut state.waiters {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Role::Follower(receiver)
                } else if !force && !state.needs_fetch(options.stale_time) {
                    Role::Resolved(state.pages.clone())
                } else {
                    state.status = QueryStatus::Fetching;
                    state.waiters = Some(Vec::new());
                    Role::Owner {
                        page_options: None,
                        mode: MergeMode::Replace,
                    }
                }
            }
            FetchRequest::FetchMore { page_options } => {
                if options.get_fetch_more.is_none() {
                    return Err(QueryError::configuration(
                        "fetch_more requires a get_fetch_more function",
                    ));
                }
                if state.waiters.is_some() {
                    // A fetch is already running.
                    Role::Resolved(state.pages.clone())
                } else {
                    match state.cursor.clone() {
                        // An override replaces the cursor's page options but
                        // never reopens an exhausted or not-yet-requested
                        // cursor; only a full reset does that.
                        PageCursor::More(cursor) => {
                            let page_options = page_options.unwrap_or(cursor);
                            state.status = QueryStatus::FetchingMore;
                            state.waiters = Some(Vec::new());
                            Role::Owner {
                                page_options: Some(page_options),
                                mode: MergeMode::Append,
                            }
                        }
                        _ => Role::Resolved(state.pages.clone()),
                    }
                }
            }
        };
        Ok(role)
    }

    fn settle_success(
        &self,
        page: V,
        mode: MergeMode,
        options: &QueryOptions<V, P>,
    ) -> Arc<Vec<V>> {
        let (pages, waiters) = {
            let mut state = self.state.lock().expect("query state lock");
            let (pages, cursor) =
                merge_page(&state.pages, page, mode, options.get_fetch_more.as_ref());
            state.pages = pages.clone();
            state.cursor = cursor;
            state.failure_count = 0;
            state.last_error = None;
            state.updated_at = Some(Instant::now());
            state.invalidated = false;
            state.status = QueryStatus::Success;
            (pages, state.waiters.take().unwrap_or_default())
        };

        for waiter in waiters {
            let _ = waiter.send(Ok(pages.clone()));
        }
        self.notify();

        if let Some(on_success) = &options.on_success {
            on_success(&pages);
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(Some(&pages), None);
        }
        pages
    }

    fn settle_error(&self, error: QueryError, options: &QueryOptions<V, P>) -> QueryError {
        let waiters = {
            let mut state = self.state.lock().expect("query state lock");
            state.status = QueryStatus::Error;
            state.waiters.take().unwrap_or_default()
        };

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        self.notify();

        tracing::warn!(key = ?self.key, error = %error, "query settled with error");
        if let Some(on_error) = &options.on_error {
            on_error(&error);
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(None, Some(&error));
        }
        error
    }

    /// Release an abandoned claim: drop parked followers and restore the
    /// status that matches the data actually present.
    fn abandon(&self) {
        let waiters = {
            let mut state = self.state.lock().expect("query state lock");
            state.status = if state.updated_at.is_some() {
                QueryStatus::Success
            } else {
                QueryStatus::Idle
            };
            state.waiters.take()
        };
        drop(waiters);
        tracing::debug!(key = ?self.key, "fetch was dropped before settling");
        self.notify();
    }

    /*
     * Teardown.
     */

    /// Cancel timers and drop parked followers. An in-flight transport call is
    /// never cancelled; it simply finds no waiters when it settles.
    pub(crate) fn dispose(&self) {
        self.garbage_collector.disable_gc();
        let waiters = {
            let mut state = self.state.lock().expect("query state lock");
            state.waiters.take()
        };
        // Dropping the senders resolves followers with a teardown error.
        drop(waiters);
    }
}
