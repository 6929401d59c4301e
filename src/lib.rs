#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Infinite Query
//!
//! An asynchronous, paginating query cache for tokio applications.
//!
//! Queries are useful for data fetching, caching, and synchronization with
//! server state. A query provides:
//! - caching
//! - request de-duplication (concurrent requests share one transport call)
//! - incremental accumulation of paginated results (`fetch_more`)
//! - retry with backoff
//! - invalidation and background refetching
//! - memory management with cache lifetimes
//! - a reactive snapshot surface, decoupled from any UI binding
//!
//! The entry point is [`QueryClient`]: an injectable handle to one isolated
//! cache. Subscribing with [`QueryClient::query`] returns a [`QueryHandle`]
//! carrying the imperative surface (`refetch`, `fetch_more`, `mutate`) and
//! pushed [`QuerySnapshot`]s.
//!
//! # A Simple Example
//!
//! ```no_run
//! use infinite_query::{QueryClient, QueryError, QueryOptions};
//!
//! // A key identifies one logical resource.
//! #[derive(Debug, Clone, Hash, Eq, PartialEq)]
//! struct Feed(String);
//!
//! // One page of results, carrying the offset of the next page.
//! #[derive(Debug, Clone)]
//! struct FeedPage {
//!     items: Vec<String>,
//!     next_offset: Option<usize>,
//! }
//!
//! async fn load_page(feed: Feed, offset: Option<usize>) -> Result<FeedPage, QueryError> {
//!     // ... transport call ...
//!     # unimplemented!()
//! }
//!
//! # async fn example() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//!
//! let options = QueryOptions::default()
//!     .set_get_fetch_more(|last: &FeedPage, _all: &[FeedPage]| last.next_offset);
//!
//! let handle = client.query(Feed("news".into()), load_page, options);
//!
//! // First page was fetched on subscription; pull in the next one.
//! let snapshot = handle.fetch_more(None).await?;
//! assert!(snapshot.pages.len() <= 2);
//! # Ok(())
//! # }
//! ```
//!
//! Environment signals (window focus, backgrounding) are injected through
//! [`TriggerSource`]; the core never owns platform event detection.

mod error;
mod garbage_collector;
mod instant;
mod pagination;
mod query;
mod query_cache;
mod query_client;
mod query_observer;
mod query_options;
mod query_state;
mod retry;
mod trigger;
mod util;

pub use error::*;
pub use instant::*;
pub use pagination::FetchMoreFn;
pub use query_client::*;
pub use query_observer::ListenerKey;
pub use query_options::*;
pub use query_state::*;
pub use retry::*;
pub use trigger::*;

/// Convenience trait for query key requirements.
pub trait QueryKey: std::fmt::Debug + Clone + std::hash::Hash + Eq + Send + Sync {}
impl<K> QueryKey for K where K: std::fmt::Debug + Clone + std::hash::Hash + Eq + Send + Sync {}

/// Convenience trait for query value (page) requirements.
pub trait QueryValue: std::fmt::Debug + Clone + Send + Sync {}
impl<V> QueryValue for V where V: std::fmt::Debug + Clone + Send + Sync {}

/// Convenience trait for page-options (cursor) requirements.
pub trait PageOptions: std::fmt::Debug + Clone + Send + Sync {}
impl<P> PageOptions for P where P: std::fmt::Debug + Clone + Send + Sync {}
