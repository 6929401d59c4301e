use std::sync::Arc;

/// Errors surfaced by the query core.
///
/// Only [`QueryError::Transport`] is subject to the retry policy. The other
/// variants describe misuse of the API and reject the initiating call
/// immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The query function rejected. Retried per the configured policy; once
    /// retries are exhausted it is recorded on the entry and surfaced through
    /// `on_error` / `on_settled`.
    #[error("query transport error: {0}")]
    Transport(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The query was configured incorrectly, e.g. `fetch_more` on a query
    /// without a `get_fetch_more` function. Never retried.
    #[error("query configuration error: {0}")]
    Configuration(String),

    /// The operation is not valid for the entry's current state. Never retried.
    #[error("query state error: {0}")]
    State(String),
}

impl QueryError {
    /// Wrap a transport failure returned by a query function.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        QueryError::Transport(Arc::new(err))
    }

    /// Wrap a plain message as a transport failure.
    pub fn transport_msg(msg: impl Into<String>) -> Self {
        QueryError::Transport(Arc::new(MessageError(msg.into())))
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        QueryError::Configuration(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        QueryError::State(msg.into())
    }

    /// Whether this error came from the query function itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, QueryError::Transport(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MessageError(String);
