use std::{sync::Arc, time::Duration};

use crate::QueryError;

/// Decides whether a failed fetch attempt should be retried.
///
/// Consulted with the failure count *after* the failed attempt was recorded,
/// so the first failure consults the policy with a count of 1.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry indefinitely.
    Always,
    /// Retry until `failure_count` exceeds the limit.
    /// `Limit(3)` performs at most 4 attempts in total.
    Limit(u32),
    /// Delegate the decision, passing `(failure_count, error)`.
    Custom(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Limit(3)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::Always => write!(f, "Always"),
            Self::Limit(n) => f.debug_tuple("Limit").field(n).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl RetryPolicy {
    /// Configuration and state errors are never retried, regardless of policy.
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        if !error.is_transport() {
            return false;
        }
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::Limit(limit) => failure_count <= *limit,
            RetryPolicy::Custom(decide) => decide(failure_count, error),
        }
    }
}

/// Delay before the next retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// Exponential backoff: 1s for the first attempt, then `2^attempt` seconds,
    /// capped at 30s.
    Exponential,
    /// Delegate, passing the attempt number.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exponential => write!(f, "Exponential"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl RetryDelay {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Exponential => exponential_backoff(attempt),
            RetryDelay::Custom(delay) => delay(attempt),
        }
    }
}

const MAX_BACKOFF_MILLIS: u64 = 30_000;

fn exponential_backoff(attempt: u32) -> Duration {
    let millis = if attempt <= 1 {
        1000
    } else {
        2u64.saturating_pow(attempt.min(16))
            .saturating_mul(1000)
            .min(MAX_BACKOFF_MILLIS)
    };
    Duration::from_millis(millis)
}
