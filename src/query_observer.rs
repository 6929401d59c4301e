use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use slotmap::{new_key_type, SlotMap};

use crate::{PageOptions, QueryError, QueryKey, QueryOptions, QuerySnapshot, QueryValue};

new_key_type! {
    /// Identifies a snapshot listener registered on a [`QueryHandle`](crate::QueryHandle).
    pub struct ListenerKey;
}

/// Type-erased query function: `(key, page options) -> page result`.
pub(crate) type Fetcher<K, V, P> =
    Arc<dyn Fn(K, Option<P>) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

type Listener<V> = Box<dyn Fn(&QuerySnapshot<V>) + Send + Sync>;

/// One active interest in a query entry.
///
/// Holds the query function and options the entry fetches with, plus the
/// listeners that receive pushed snapshots. The entry keeps a copy of every
/// subscribed observer; the entry is eligible for garbage collection once the
/// last one unsubscribes.
pub(crate) struct QueryObserver<K, V, P> {
    id: ObserverKey,
    fetcher: Fetcher<K, V, P>,
    options: Arc<QueryOptions<V, P>>,
    listeners: Arc<Mutex<SlotMap<ListenerKey, Listener<V>>>>,
}

impl<K, V, P> Clone for QueryObserver<K, V, P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            fetcher: self.fetcher.clone(),
            options: self.options.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<K, V, P> std::fmt::Debug for QueryObserver<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("fetcher", &"...")
            .field("listeners", &"...")
            .finish()
    }
}

impl<K, V, P> QueryObserver<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    pub(crate) fn with_fetcher<F, Fu>(fetcher: F, options: QueryOptions<V, P>) -> Self
    where
        F: Fn(K, Option<P>) -> Fu + Send + Sync + 'static,
        Fu: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let fetcher = Arc::new(move |key, page_options| fetcher(key, page_options).boxed())
            as Fetcher<K, V, P>;

        Self {
            id: next_id(),
            fetcher,
            options: Arc::new(options),
            listeners: Arc::new(Mutex::new(SlotMap::with_key())),
        }
    }

    pub(crate) fn get_id(&self) -> ObserverKey {
        self.id
    }

    pub(crate) fn fetcher(&self) -> Fetcher<K, V, P> {
        self.fetcher.clone()
    }

    pub(crate) fn options(&self) -> &QueryOptions<V, P> {
        &self.options
    }

    pub(crate) fn notify(&self, snapshot: &QuerySnapshot<V>) {
        let listeners = self.listeners.lock().expect("notify listeners lock");
        for listener in listeners.values() {
            listener(snapshot);
        }
    }

    pub(crate) fn add_listener(
        &self,
        listener: impl Fn(&QuerySnapshot<V>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.listeners
            .lock()
            .expect("add_listener lock")
            .insert(Box::new(listener))
    }

    pub(crate) fn remove_listener(&self, key: ListenerKey) -> bool {
        self.listeners
            .lock()
            .expect("remove_listener lock")
            .remove(key)
            .is_some()
    }
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObserverKey(u32);

fn next_id() -> ObserverKey {
    ObserverKey(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}
