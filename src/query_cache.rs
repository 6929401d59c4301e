use std::{
    any::{Any, TypeId},
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
};

use crate::{
    query::Query, query_observer::QueryObserver, PageOptions, QueryKey, QueryOptions, QueryValue,
    Trigger,
};

/// Process-wide mapping from key to cache entry.
///
/// Entries of different `(K, V, P)` types share one map through type erasure,
/// so a single client can cache unrelated queries side by side. The map-level
/// lock only guards lookups and insertions; entry state has its own lock.
pub(crate) struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Clone for QueryCache {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner {
    cache: Mutex<HashMap<(TypeId, TypeId, TypeId), Box<dyn CacheEntryTrait>>>,
}

pub(crate) struct CacheEntry<K, V, P>(HashMap<K, Query<K, V, P>>);

// Trait to enable cache-wide operations across distinct entry maps.
pub(crate) trait CacheEntryTrait: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn size(&self) -> usize;
    fn invalidate(&self);
    fn on_trigger(&self, trigger: Trigger);
    fn shutdown(&self);
}

impl<K, V, P> CacheEntryTrait for CacheEntry<K, V, P>
where
    K: QueryKey + 'static,
    V: QueryValue + 'static,
    P: PageOptions + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn invalidate(&self) {
        for query in self.0.values() {
            query.invalidate();
        }
    }

    fn on_trigger(&self, trigger: Trigger) {
        for query in self.0.values() {
            query.handle_trigger(trigger);
        }
    }

    fn shutdown(&self) {
        for query in self.0.values() {
            query.dispose();
        }
    }
}

impl QueryCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the existing entry for `key` or creates an Idle one.
    /// A created entry is seeded from `options.initial_data`, if present.
    pub(crate) fn get_or_create_query<K, V, P>(
        &self,
        key: K,
        options: &QueryOptions<V, P>,
    ) -> Query<K, V, P>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let evict = self.evict_closure::<K, V, P>(&key);

        let (query, created) = self.use_cache(move |cache| {
            match cache.entry(key) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let query = Query::new(entry.key().clone(), options.gc_time, evict);
                    (entry.insert(query).clone(), true)
                }
            }
        });

        if created {
            tracing::debug!(key = ?query.key, "created cache entry");
            if let Some(initial_data) = options.initial_data.clone() {
                query.seed(initial_data, options.get_fetch_more.as_ref());
            }
        }

        query
    }

    /// Returns the entry for `key` with `observer` already attached, creating
    /// the entry if needed.
    ///
    /// Lookup and observer insertion happen in one critical section on the map
    /// lock, so a GC timer firing concurrently either sees the observer and
    /// backs off, or has already removed the entry and a fresh one is created.
    pub(crate) fn subscribe_query<K, V, P>(
        &self,
        key: K,
        observer: &QueryObserver<K, V, P>,
    ) -> Query<K, V, P>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let options = observer.options();
        let evict = self.evict_closure::<K, V, P>(&key);

        let (query, created) = self.use_cache(move |cache| {
            match cache.entry(key) {
                Entry::Occupied(entry) => {
                    let query = entry.get().clone();
                    query.subscribe(observer);
                    (query, false)
                }
                Entry::Vacant(entry) => {
                    let query = Query::new(entry.key().clone(), options.gc_time, evict);
                    query.subscribe(observer);
                    (entry.insert(query).clone(), true)
                }
            }
        });

        if created {
            tracing::debug!(key = ?query.key, "created cache entry");
            if let Some(initial_data) = options.initial_data.clone() {
                query.seed(initial_data, options.get_fetch_more.as_ref());
            }
        }

        query
    }

    fn evict_closure<K, V, P>(&self, key: &K) -> Arc<dyn Fn() + Send + Sync>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let inner = Arc::downgrade(&self.inner);
        let key = key.clone();
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                QueryCache { inner }.evict_inactive::<K, V, P>(&key);
            }
        })
    }

    pub(crate) fn get_query<K, V, P>(&self, key: &K) -> Option<Query<K, V, P>>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        self.use_cache_option(|cache| cache.get(key).cloned())
    }

    /// Removes an entry unconditionally. Fails silently if absent.
    pub(crate) fn evict_query<K, V, P>(&self, key: &K) -> bool
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let removed = self.use_cache_option::<K, V, P, _, _>(|cache| cache.remove(key));

        match removed {
            Some(query) => {
                query.dispose();
                tracing::debug!(key = ?query.key, "evicted cache entry");
                true
            }
            None => false,
        }
    }

    /// GC path: removes the entry only if it is still unobserved. A subscriber
    /// arriving between timer fire and this call wins.
    pub(crate) fn evict_inactive<K, V, P>(&self, key: &K) -> bool
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let mut cache = self.inner.cache.lock().expect("cache map lock");
        let type_key = (TypeId::of::<K>(), TypeId::of::<V>(), TypeId::of::<P>());
        let Some(entry) = cache.get_mut(&type_key) else {
            return false;
        };
        let Some(entry) = entry.as_any_mut().downcast_mut::<CacheEntry<K, V, P>>() else {
            return false;
        };

        match entry.0.get(key) {
            Some(query) if !query.has_observers() => {
                let query = entry.0.remove(key);
                if let Some(query) = query {
                    query.dispose();
                    tracing::debug!(key = ?query.key, "garbage collected cache entry");
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn invalidate_all_queries(&self) {
        let cache = self.inner.cache.lock().expect("cache map lock");
        for entry in cache.values() {
            entry.invalidate();
        }
    }

    pub(crate) fn on_trigger(&self, trigger: Trigger) {
        let cache = self.inner.cache.lock().expect("cache map lock");
        for entry in cache.values() {
            entry.on_trigger(trigger);
        }
    }

    pub(crate) fn size(&self) -> usize {
        let cache = self.inner.cache.lock().expect("cache map lock");
        cache.values().map(|entry| entry.size()).sum()
    }

    /// Teardown: cancel every entry's timers and drop the whole map.
    pub(crate) fn clear(&self) {
        let mut cache = self.inner.cache.lock().expect("cache map lock");
        for entry in cache.values() {
            entry.shutdown();
        }
        cache.clear();
    }

    fn use_cache<K, V, P, R>(
        &self,
        func: impl FnOnce(&mut HashMap<K, Query<K, V, P>>) -> R,
    ) -> R
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
    {
        let mut cache = self.inner.cache.lock().expect("cache map lock");

        let type_key = (TypeId::of::<K>(), TypeId::of::<V>(), TypeId::of::<P>());

        let entry: &mut Box<dyn CacheEntryTrait> = match cache.entry(type_key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let wrapped: CacheEntry<K, V, P> = CacheEntry(HashMap::new());
                entry.insert(Box::new(wrapped))
            }
        };

        let entry: &mut CacheEntry<K, V, P> = entry
            .as_any_mut()
            .downcast_mut::<CacheEntry<K, V, P>>()
            .expect(EXPECT_CACHE_ERROR);

        func(&mut entry.0)
    }

    fn use_cache_option<K, V, P, F, R>(&self, func: F) -> Option<R>
    where
        K: QueryKey + 'static,
        V: QueryValue + 'static,
        P: PageOptions + 'static,
        F: FnOnce(&mut HashMap<K, Query<K, V, P>>) -> Option<R>,
        R: 'static,
    {
        let mut cache = self.inner.cache.lock().expect("cache map lock");
        let type_key = (TypeId::of::<K>(), TypeId::of::<V>(), TypeId::of::<P>());
        let entry = cache.get_mut(&type_key)?;
        let entry = entry
            .as_any_mut()
            .downcast_mut::<CacheEntry<K, V, P>>()
            .expect(EXPECT_CACHE_ERROR);
        func(&mut entry.0)
    }
}

const EXPECT_CACHE_ERROR: &str =
    "Error: Query Cache Type Mismatch. This should not happen. Please file a bug report.";
