use std::{sync::Arc, time::Duration};

use crate::{
    pagination::FetchMoreFn,
    retry::{RetryDelay, RetryPolicy},
    QueryError,
};

/// Invoked with the full page list after every successful fetch.
pub type SuccessCallback<V> = Arc<dyn Fn(&[V]) + Send + Sync>;
/// Invoked once retries for a fetch cycle are exhausted.
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
/// Invoked when a fetch cycle settles, successfully or not.
pub type SettledCallback<V> = Arc<dyn Fn(Option<&[V]>, Option<&QueryError>) + Send + Sync>;

/// Default options for all queries under a client.
/// Only differs from [`QueryOptions`] in that it carries no per-query values.
#[derive(Debug, Clone)]
pub struct DefaultQueryOptions {
    /// Time before a query is considered stale.
    pub stale_time: Option<Duration>,
    /// Time before an inactive query is removed from cache.
    pub gc_time: Option<Duration>,
    /// Time between forced periodic refetches.
    pub refetch_interval: Option<Duration>,
    /// Retry policy for failed fetch attempts.
    pub retry: RetryPolicy,
    /// Delay before each retry attempt.
    pub retry_delay: RetryDelay,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Some(DEFAULT_STALE_TIME),
            gc_time: Some(DEFAULT_GC_TIME),
            refetch_interval: None,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
        }
    }
}

const DEFAULT_STALE_TIME: Duration = Duration::from_secs(10);
const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

/// Options for a single query.
#[derive(Clone)]
pub struct QueryOptions<V, P> {
    /// Pages to seed the entry with before the first fetch. A seeded entry
    /// starts in Success with `updated_at` set to creation time.
    pub initial_data: Option<Vec<V>>,
    /// Derives the next page options from the last fetched page and the full
    /// page list. Absent means the query is single-page.
    pub get_fetch_more: Option<FetchMoreFn<V, P>>,
    /// When true, the query never fetches automatically; only explicit
    /// `refetch` / `fetch_more` calls run it.
    pub manual: bool,
    /// Fetch on first subscription when the entry is empty or stale.
    /// Default true.
    pub refetch_on_mount: bool,
    /// React to window-focus triggers with a staleness-gated refetch.
    /// Default true.
    pub refetch_on_window_focus: bool,
    /// If set, forces a periodic refetch on its own cadence, regardless of
    /// staleness.
    pub refetch_interval: Option<Duration>,
    /// Keep the refetch interval running while the environment reports being
    /// backgrounded. Default false.
    pub refetch_interval_in_background: bool,
    /// Retry policy for failed fetch attempts.
    pub retry: RetryPolicy,
    /// Delay before each retry attempt.
    pub retry_delay: RetryDelay,
    /// The duration that should pass before the entry is considered stale.
    /// If `None`, the entry never goes stale on its own.
    /// Can never be greater than `gc_time`. Default is 10 seconds.
    pub stale_time: Option<Duration>,
    /// How long an entry without subscribers stays cached.
    /// If `None`, the entry is never collected automatically.
    /// Default is 5 minutes.
    /// NOTE: if different gc times are used for the same key, the MAXIMUM is used.
    pub gc_time: Option<Duration>,
    /// Pass-through flag for rendering integrations that suspend on the
    /// status flags. Has no effect on the core.
    pub suspense: bool,
    /// Called with the page list after every successful fetch.
    pub on_success: Option<SuccessCallback<V>>,
    /// Called when retries for a fetch cycle are exhausted.
    pub on_error: Option<ErrorCallback>,
    /// Called when a fetch cycle settles, successfully or not.
    pub on_settled: Option<SettledCallback<V>>,
}

impl<V, P> QueryOptions<V, P> {
    /// Options seeded from a client's defaults.
    pub fn with_defaults(defaults: &DefaultQueryOptions) -> Self {
        Self {
            stale_time: defaults.stale_time,
            gc_time: defaults.gc_time,
            refetch_interval: defaults.refetch_interval,
            retry: defaults.retry.clone(),
            retry_delay: defaults.retry_delay.clone(),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            initial_data: None,
            get_fetch_more: None,
            manual: false,
            refetch_on_mount: true,
            refetch_on_window_focus: true,
            refetch_interval: None,
            refetch_interval_in_background: false,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            stale_time: Some(DEFAULT_STALE_TIME),
            gc_time: Some(DEFAULT_GC_TIME),
            suspense: false,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Set the initial data.
    pub fn set_initial_data(self, initial_data: Option<Vec<V>>) -> Self {
        QueryOptions {
            initial_data,
            ..self
        }
    }

    /// Set the fetch-more function, making the query paginated.
    pub fn set_get_fetch_more(
        self,
        get_fetch_more: impl Fn(&V, &[V]) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        QueryOptions {
            get_fetch_more: Some(Arc::new(get_fetch_more)),
            ..self
        }
    }

    /// Set manual mode.
    pub fn set_manual(self, manual: bool) -> Self {
        QueryOptions { manual, ..self }
    }

    /// Set the stale time.
    pub fn set_stale_time(self, stale_time: Option<Duration>) -> Self {
        QueryOptions { stale_time, ..self }
    }

    /// Set the gc time.
    pub fn set_gc_time(self, gc_time: Option<Duration>) -> Self {
        QueryOptions { gc_time, ..self }
    }

    /// Set the refetch interval.
    pub fn set_refetch_interval(self, refetch_interval: Option<Duration>) -> Self {
        QueryOptions {
            refetch_interval,
            ..self
        }
    }

    /// Set the retry policy.
    pub fn set_retry(self, retry: RetryPolicy) -> Self {
        QueryOptions { retry, ..self }
    }

    /// Set the retry delay.
    pub fn set_retry_delay(self, retry_delay: RetryDelay) -> Self {
        QueryOptions {
            retry_delay,
            ..self
        }
    }

    /// Set the success callback.
    pub fn set_on_success(self, on_success: impl Fn(&[V]) + Send + Sync + 'static) -> Self {
        QueryOptions {
            on_success: Some(Arc::new(on_success)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn set_on_error(self, on_error: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        QueryOptions {
            on_error: Some(Arc::new(on_error)),
            ..self
        }
    }

    /// Set the settled callback.
    pub fn set_on_settled(
        self,
        on_settled: impl Fn(Option<&[V]>, Option<&QueryError>) + Send + Sync + 'static,
    ) -> Self {
        QueryOptions {
            on_settled: Some(Arc::new(on_settled)),
            ..self
        }
    }

    /// Ensures that `stale_time` is <= `gc_time`.
    pub fn validate(self) -> Self {
        let stale_time = ensure_valid_stale_time(&self.stale_time, &self.gc_time);

        QueryOptions { stale_time, ..self }
    }
}

impl<V, P> Default for QueryOptions<V, P> {
    fn default() -> Self {
        Self::empty().validate()
    }
}

impl<V, P> std::fmt::Debug for QueryOptions<V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("manual", &self.manual)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_interval", &self.refetch_interval)
            .field(
                "refetch_interval_in_background",
                &self.refetch_interval_in_background,
            )
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("suspense", &self.suspense)
            .finish()
    }
}

fn ensure_valid_stale_time(
    stale_time: &Option<Duration>,
    gc_time: &Option<Duration>,
) -> Option<Duration> {
    match (stale_time, gc_time) {
        (Some(ref stale_time), Some(ref gc_time)) => {
            if stale_time > gc_time {
                tracing::warn!(
                    stale_time = stale_time.as_millis() as u64,
                    gc_time = gc_time.as_millis() as u64,
                    "stale_time is greater than gc_time. Using gc_time instead."
                );
                Some(*gc_time)
            } else {
                Some(*stale_time)
            }
        }
        (stale_time, _) => *stale_time,
    }
}
