//! The engine instance shared by queries and mutations.
//!
//! A [`Client`] owns the [`SplitCache`], the [`RequestQueue`], the map of
//! ongoing requests and the per-instance flags (hydration, purge epoch). The
//! query engine lives in [`query`] and the mutation engine in [`mutation`];
//! both are exposed as methods on `Client`.
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let client = Client::<Users>::new();
//!
//! let outcome = client.query(
//!     Request::new(User(1))
//!         .fetch_policy(FetchPolicy::CacheAndNetwork)
//!         .to_cache(merge_user)
//!         .from_cache(read_user),
//!     None,
//! )?;
//! render(&outcome.state);
//!
//! if let Some(response) = outcome.response {
//!     let user = response.await?;
//! }
//! ```

pub mod mutation;
pub mod query;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

use crate::cache::{CacheSnapshot, SplitCache};
use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::lock;
use crate::queue::RequestQueue;
use crate::token::CancelToken;

/// The eventual result of a query or mutation.
///
/// Every caller sharing one network request holds a clone of the same
/// `Response`. The underlying work runs on its own task, so the cache is
/// updated even if every `Response` is dropped.
pub struct Response<T> {
    inner: Shared<BoxFuture<'static, Result<T, QueryError>>>,
}

impl<T> Response<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(future: impl Future<Output = Result<T, QueryError>> + Send + 'static) -> Self {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// Drives the work to completion on a Tokio task.
    pub(crate) fn spawn(&self) {
        tokio::spawn(self.inner.clone());
    }

    /// Returns the result if the work has already settled.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, QueryError>> {
        self.inner.peek().cloned()
    }
}

impl<T> Clone for Response<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Future for Response<T> {
    type Output = Result<T, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response").finish_non_exhaustive()
    }
}

struct ClientInner<C> {
    config: ClientConfig,
    cache: SplitCache<C>,
    queue: RequestQueue,
    /// Ongoing queries keyed by request id. Values are `query::Ongoing<R, C>`
    /// for whichever resource type registered the id.
    ongoing: DashMap<String, Box<dyn Any + Send + Sync>>,
    /// Operations whose settlement may still write to the cache.
    relevant: Mutex<HashSet<u64>>,
    purge_token: Mutex<CancelToken>,
    hydrating: AtomicBool,
    next_op: AtomicU64,
}

/// A data-fetching client. Cloning yields another handle to the same client.
///
/// Methods that start network work spawn Tokio tasks and must be called from
/// within a Tokio runtime.
pub struct Client<C> {
    inner: Arc<ClientInner<C>>,
}

impl<C> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> Default for Client<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Client<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    /// Creates a new client with default configuration and an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a new client with the given configuration.
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self::build(config, SplitCache::new(), false)
    }

    /// Creates a client whose cache starts from a snapshot transferred from
    /// another process. The client is hydrating until
    /// [`on_hydrate_complete`](Self::on_hydrate_complete) is called.
    #[must_use]
    pub fn with_snapshot(config: ClientConfig, snapshot: CacheSnapshot<C>) -> Self {
        Self::build(config, SplitCache::from_snapshot(snapshot), true)
    }

    fn build(config: ClientConfig, cache: SplitCache<C>, hydrating: bool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                cache,
                queue: RequestQueue::new(),
                ongoing: DashMap::new(),
                relevant: Mutex::new(HashSet::new()),
                purge_token: Mutex::new(CancelToken::new()),
                hydrating: AtomicBool::new(hydrating),
                next_op: AtomicU64::new(1),
            }),
        }
    }

    /// Aborts every in-flight operation and empties the cache.
    ///
    /// Aborted operations reject with [`QueryError::Aborted`] and leave no
    /// trace in the cache.
    pub fn purge(&self) {
        let token = std::mem::take(&mut *lock(&self.inner.purge_token));
        let dropped = {
            let mut relevant = lock(&self.inner.relevant);
            let count = relevant.len();
            relevant.clear();
            count
        };
        self.inner.ongoing.clear();

        token.fire();
        self.inner.cache.clear();
        debug!(dropped, "client purged");
    }
}

impl<C> Client<C> {
    /// Marks hydration as finished. Later calls are no-ops.
    pub fn on_hydrate_complete(&self) {
        if self.inner.hydrating.swap(false, Ordering::SeqCst) {
            debug!("hydration complete");
        }
    }

    #[must_use]
    pub fn is_hydrating(&self) -> bool {
        self.inner.hydrating.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The cache backing this client.
    #[must_use]
    pub fn cache(&self) -> &SplitCache<C> {
        &self.inner.cache
    }

    /// The queue every network operation of this client runs through.
    #[must_use]
    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    /// Returns `true` while a query for `request_id` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.inner.ongoing.contains_key(request_id)
    }

    /// Number of distinct queries in flight.
    #[must_use]
    pub fn ongoing_count(&self) -> usize {
        self.inner.ongoing.len()
    }

    fn begin_operation(&self) -> u64 {
        let id = self.inner.next_op.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.relevant).insert(id);
        id
    }

    /// Retires an operation. Returns `false` if a purge already dropped it.
    fn retire_operation(&self, id: u64) -> bool {
        lock(&self.inner.relevant).remove(&id)
    }

    fn purge_token(&self) -> CancelToken {
        lock(&self.inner.purge_token).clone()
    }
}

impl<C> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("ongoing", &self.inner.ongoing.len())
            .field("queue_depth", &self.inner.queue.depth())
            .field("hydrating", &self.is_hydrating())
            .finish_non_exhaustive()
    }
}
