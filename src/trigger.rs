use async_trait::async_trait;

/// An abstract environment signal the core reacts to.
///
/// The core never owns focus detection or platform timers; an injected
/// [`TriggerSource`] produces these and the client turns them into
/// staleness-gated refetches of actively observed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The environment regained focus (e.g. a window-focus event).
    WindowFocus,
    /// A generic periodic poll signal.
    Poll,
}

/// Capability producing environment triggers.
///
/// Implementations wrap whatever the runtime environment provides: window
/// events, visibility changes, OS timers. Tests can drive a source by hand.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    /// The next trigger, or `None` once the source is exhausted.
    async fn next_trigger(&self) -> Option<Trigger>;

    /// Whether the environment is currently backgrounded. Gates refetch
    /// intervals unless `refetch_interval_in_background` is set.
    fn is_backgrounded(&self) -> bool {
        false
    }
}
