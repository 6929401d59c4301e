use std::sync::Arc;

use crate::query_state::PageCursor;

/// Derives the page options for the next page from the freshly fetched page
/// and the full accumulated page list. Returning `None` marks the query as
/// exhausted until the next full reset.
pub type FetchMoreFn<V, P> = Arc<dyn Fn(&V, &[V]) -> Option<P> + Send + Sync>;

/// How a freshly fetched page combines with the existing page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeMode {
    /// A plain refetch of page 0: discards all prior pages.
    Replace,
    /// A `fetch_more`: appends after the existing pages.
    Append,
}

/// Merge a fetched page into the page list and compute the next cursor.
///
/// Always builds a fresh vector so snapshots holding the old list never
/// observe the merge.
pub(crate) fn merge_page<V, P>(
    pages: &Arc<Vec<V>>,
    new_page: V,
    mode: MergeMode,
    get_fetch_more: Option<&FetchMoreFn<V, P>>,
) -> (Arc<Vec<V>>, PageCursor<P>)
where
    V: Clone,
{
    let merged = match mode {
        MergeMode::Replace => vec![new_page],
        MergeMode::Append => {
            let mut merged = Vec::with_capacity(pages.len() + 1);
            merged.extend(pages.iter().cloned());
            merged.push(new_page);
            merged
        }
    };

    // Non-empty by construction.
    let cursor = match (merged.last(), get_fetch_more) {
        // Without a fetch-more function there is never a next page.
        (_, None) => PageCursor::Exhausted,
        (Some(last), Some(get_fetch_more)) => match get_fetch_more(last, &merged) {
            Some(options) => PageCursor::More(options),
            None => PageCursor::Exhausted,
        },
        (None, _) => PageCursor::Exhausted,
    };

    (Arc::new(merged), cursor)
}

/// Compute a cursor for externally supplied pages (initial data, mutate).
pub(crate) fn cursor_for<V, P>(
    pages: &[V],
    get_fetch_more: Option<&FetchMoreFn<V, P>>,
) -> PageCursor<P> {
    match (pages.last(), get_fetch_more) {
        (Some(last), Some(get_fetch_more)) => match get_fetch_more(last, pages) {
            Some(options) => PageCursor::More(options),
            None => PageCursor::Exhausted,
        },
        (None, _) => PageCursor::NotRequested,
        (_, None) => PageCursor::Exhausted,
    }
}
