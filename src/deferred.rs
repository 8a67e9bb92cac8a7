//! Gated, cancellable wrapper around a request-producing function.

use std::future::Future;

use crate::error::QueryError;
use crate::token::{CancelToken, Gate};

/// Start and cancel signals for [`deferred`].
#[derive(Debug, Clone, Default)]
pub struct DeferredOptions {
    /// The factory is not invoked until this gate opens.
    pub start: Option<Gate>,
    /// Firing this rejects the operation with [`QueryError::Aborted`].
    pub cancel: Option<CancelToken>,
}

impl DeferredOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn start_on(mut self, gate: Gate) -> Self {
        self.start = Some(gate);
        self
    }

    #[must_use]
    pub fn cancel_on(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Runs `factory` once `options.start` opens, racing it against `options.cancel`.
///
/// The factory receives the cancel token so it can stop its own work early; the
/// wrapper rejects with [`QueryError::Aborted`] as soon as the token fires
/// whether or not the factory notices. A token that fires while still waiting
/// for the gate rejects without ever invoking the factory.
///
/// # Example
///
/// ```
/// use sluice::deferred::{DeferredOptions, deferred};
/// use sluice::token::Gate;
///
/// # tokio_test_block(async {
/// let gate = Gate::new();
/// let op = deferred(
///     |_cancel| async { Ok::<_, sluice::QueryError>(42) },
///     DeferredOptions::new().start_on(gate.clone()),
/// );
/// gate.open();
/// assert_eq!(op.await, Ok(42));
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub async fn deferred<T, F, Fut>(factory: F, options: DeferredOptions) -> Result<T, QueryError>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let cancel = options.cancel.unwrap_or_default();
    if cancel.is_fired() {
        return Err(QueryError::Aborted);
    }

    if let Some(start) = options.start {
        tokio::select! {
            biased;
            () = cancel.fired() => return Err(QueryError::Aborted),
            () = start.wait() => {}
        }
    }

    let operation = factory(cancel.clone());
    tokio::select! {
        biased;
        () = cancel.fired() => Err(QueryError::Aborted),
        result = operation => result,
    }
}
