use std::sync::Arc;

use crate::{Instant, QueryError};

/// The lifecycle of a query entry.
///
/// Each variant corresponds to a particular state of the entry's fetch state
/// machine, from creation through fetching to settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// The entry exists but no fetch has been initiated yet.
    #[default]
    Idle,
    /// A fetch of the first page is in flight.
    Fetching,
    /// A fetch of an additional page is in flight.
    FetchingMore,
    /// The last fetch settled successfully.
    Success,
    /// The last fetch failed and retries are exhausted.
    Error,
}

impl QueryStatus {
    /// True while any fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        matches!(self, QueryStatus::Fetching | QueryStatus::FetchingMore)
    }
}

/// Where the next `fetch_more` would start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum PageCursor<P> {
    /// No page has been fetched yet.
    #[default]
    NotRequested,
    /// The page options to pass to the query function for the next page.
    More(P),
    /// The fetch-more function reported that no further pages exist.
    /// Sticky until the next full reset of the entry.
    Exhausted,
}

impl<P> PageCursor<P> {
    pub(crate) fn can_fetch_more(&self) -> bool {
        matches!(self, PageCursor::More(_))
    }
}

/// Input to a local entry mutation: either a literal page list or a pure
/// function of the old pages.
pub enum PagesUpdate<V> {
    /// Replace the page list outright.
    Set(Vec<V>),
    /// Derive the new page list from the old one.
    Map(Box<dyn FnOnce(&[V]) -> Vec<V> + Send>),
}

impl<V> From<Vec<V>> for PagesUpdate<V> {
    fn from(pages: Vec<V>) -> Self {
        PagesUpdate::Set(pages)
    }
}

impl<V> std::fmt::Debug for PagesUpdate<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set(_) => write!(f, "Set(..)"),
            Self::Map(_) => write!(f, "Map(..)"),
        }
    }
}

/// An immutable view of a query entry, handed to subscribers.
///
/// The page list is shared, never mutated in place: holders of an old snapshot
/// keep seeing the pages as they were when the snapshot was taken.
#[derive(Clone)]
pub struct QuerySnapshot<V> {
    /// All fetched pages, in fetch order. The first page is index 0.
    pub pages: Arc<Vec<V>>,
    /// Current state machine position.
    pub status: QueryStatus,
    /// Consecutive failed attempts of the current fetch cycle.
    pub failure_count: u32,
    /// Whether a `fetch_more` would issue a new request.
    pub can_fetch_more: bool,
    /// Last captured error. Cleared on success.
    pub last_error: Option<QueryError>,
    /// Timestamp of the last successful fetch.
    pub updated_at: Option<Instant>,
}

impl<V> QuerySnapshot<V> {
    /// True while any fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.status.is_fetching()
    }

    /// True while an additional page is being fetched.
    pub fn is_fetching_more(&self) -> bool {
        self.status == QueryStatus::FetchingMore
    }

    /// The most recently fetched page, if any.
    pub fn latest_page(&self) -> Option<&V> {
        self.pages.last()
    }
}

impl<V> std::fmt::Debug for QuerySnapshot<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySnapshot")
            .field("pages", &self.pages)
            .field("status", &self.status)
            .field("failure_count", &self.failure_count)
            .field("can_fetch_more", &self.can_fetch_more)
            .field("last_error", &self.last_error)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
