use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Network failures are opaque to the engine: whatever a [`Resource`] returns is
/// stored verbatim in the cache's per-request error slot. `Aborted` is the
/// expected outcome of cancellation and `Usage` marks a programmer error that is
/// reported synchronously, before anything is enqueued.
///
/// [`Resource`]: crate::request::Resource
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryError {
    #[error("Request aborted")]
    Aborted,

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("No cached data for request {0}")]
    NotCached(String),
}

impl QueryError {
    /// Returns `true` if the error was produced by a cancellation token firing.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns `true` for programmer errors that never reach the cache.
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}
