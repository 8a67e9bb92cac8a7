//! # Sluice - request orchestration for client-side data fetching
//!
//! Sluice decides, for each declarative [`Request`](request::Request), whether
//! to serve cached data, issue a network operation, or both, while staying
//! consistent under concurrent, overlapping and cancellable calls from many
//! independent consumers. It plays the role SWR or TanStack Query play in the
//! browser, minus the UI bindings and the transport.
//!
//! ## Core Components
//!
//! - [`Client`](client::Client): the engine instance. Queries, mutations,
//!   purge and hydration are methods on it.
//! - [`RequestQueue`](queue::RequestQueue): orders operations. Neighbouring
//!   queries share a slot; a mutation waits for everything queued before it.
//! - [`SplitCache`](cache::SplitCache): the cache. Forks into splits so
//!   concurrent optimistic writes roll back independently.
//! - [`CancelToken`](token::CancelToken) and [`Gate`](token::Gate):
//!   cooperative cancellation and start signals.
//!
//! ## Control flow
//!
//! 1. A consumer calls [`Client::query`](client::Client::query) or
//!    [`Client::mutate`](client::Client::mutate) with a request
//! 2. The engine evaluates the fetch policy against the cache
//! 3. If the network is needed, the operation is enqueued and deduplicated
//! 4. On settlement the cache is updated and its subscribers are notified
//!
//! The engine never retries and never imposes timeouts; callers decide when
//! to re-issue a request and pass their own cancellation tokens.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use futures::future::BoxFuture;
//! use sluice::prelude::*;
//!
//! struct Greeting(&'static str);
//!
//! impl Resource for Greeting {
//!     type Data = String;
//!
//!     fn request_id(&self) -> String {
//!         format!("greeting/{}", self.0)
//!     }
//!
//!     fn fetch(&self, _cancel: CancelToken) -> BoxFuture<'static, Result<String, QueryError>> {
//!         let name = self.0;
//!         Box::pin(async move { Ok(format!("hello {name}")) })
//!     }
//! }
//!
//! type Cache = BTreeMap<String, String>;
//!
//! fn greeting(name: &'static str) -> Request<Greeting, Cache> {
//!     Request::<Greeting, Cache>::new(Greeting(name))
//!         .to_cache(|args| {
//!             let mut next = args.cache_data.clone();
//!             next.insert(args.request_id.to_string(), args.data.clone());
//!             next
//!         })
//!         .from_cache(|args| args.cache_data.get(args.request_id).cloned())
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let client = Client::<Cache>::new();
//!
//! let data = client.fetch_query(greeting("world")).await?;
//! assert_eq!(data, "hello world");
//!
//! // Served from cache now
//! assert_eq!(client.read_query(&greeting("world")).data(), Some(&data));
//! # Ok::<_, QueryError>(())
//! # }).unwrap();
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod client;
pub mod config;
pub mod deferred;
pub mod error;
pub mod prelude;
pub mod queue;
pub mod request;
pub mod token;

pub use error::QueryError;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent before
/// running user callbacks, so a poisoned lock still guards valid data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
