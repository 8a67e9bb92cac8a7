//! Query engine: cache-policy evaluation, request deduplication, cancellation
//! refcounting and reruns.
//!
//! # Lifecycle of an ongoing request
//!
//! ```text
//! Idle --enqueue--> InFlight --settle, rerun requested--> InFlight
//!                   InFlight --settle------------------> Terminal (cache updated)
//!                   InFlight --abort, refcount 0-------> Terminal (rejected, error cached)
//! ```
//!
//! At most one ongoing request exists per request id. Callers arriving while
//! it is in flight attach to it and share its [`Response`]; each attached
//! caller's soft-abort token withdraws one reference, and the network call is
//! aborted only when the count reaches zero. A caller's hard-abort token
//! aborts it outright.

use std::sync::{Arc, Mutex, Weak};

use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::cache::{CacheSubscription, CacheUpdate};
use crate::error::QueryError;
use crate::lock;
use crate::queue::RequestKind;
use crate::request::{FetchPolicy, FromCache, QueryState, Request, Resource, ToCache, ToCacheFn};
use crate::token::{CancelToken, Wiring, when_any_fires, wire_tokens};

use super::{Client, ClientInner, Response};

/// Callback invoked with a fresh state whenever a query's cached data or error
/// changes.
pub type OnChange<T> = Box<dyn Fn(QueryState<T>) + Send + Sync>;

/// Where a subscribed query's fresh states go.
enum Delivery<T> {
    Callback(OnChange<T>),
    /// Sent while the comparison lock is held, so the receiver sees states in
    /// cache order.
    Channel(mpsc::UnboundedSender<QueryState<T>>),
}

/// What a call to [`Client::query`] produced.
#[derive(Debug)]
pub struct QueryOutcome<T> {
    /// The state as of the call.
    pub state: QueryState<T>,
    /// The network request this call issued or joined, if any.
    pub response: Option<Response<T>>,
    /// Present when an `on_change` callback was supplied. Dropping it stops
    /// the callbacks.
    pub subscription: Option<CacheSubscription>,
}

struct Merger<R: Resource, C> {
    resource: Arc<R>,
    to_cache: ToCacheFn<R, C>,
}

struct OngoingState<R: Resource, C> {
    token: CancelToken,
    purge_wiring: Option<Wiring>,
    consumer_wiring: Vec<Wiring>,
    refcount: usize,
    mergers: Vec<Merger<R, C>>,
    should_rerun: bool,
}

impl<R: Resource, C> OngoingState<R, C> {
    fn record(&mut self, request: &Request<R, C>) {
        self.refcount += 1;
        if request.is_cacheable() {
            if let Some(to_cache) = &request.to_cache {
                self.mergers.push(Merger {
                    resource: request.resource.clone(),
                    to_cache: to_cache.clone(),
                });
            }
        }
    }

    /// Whether a new caller may share this request instead of starting one.
    fn accepts_callers(&self) -> bool {
        !self.token.is_fired() || self.should_rerun
    }
}

/// The registered in-flight request for one request id.
struct Ongoing<R: Resource, C> {
    op_id: u64,
    response: Response<R::Data>,
    state: Arc<Mutex<OngoingState<R, C>>>,
}

impl<R: Resource, C> Clone for Ongoing<R, C> {
    fn clone(&self) -> Self {
        Self {
            op_id: self.op_id,
            response: self.response.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C> Client<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    /// Evaluates `request` against the cache and, if its fetch policy requires
    /// it, issues or joins a network request.
    ///
    /// With `on_change`, the callback is re-invoked with a fresh state every
    /// time the cached `(data, error)` pair for this request changes, until the
    /// returned subscription is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Usage`] if `on_change` is given for a
    /// [`FetchPolicy::NoCache`] request, which never touches the cache.
    ///
    /// # Panics
    ///
    /// Panics if a network request must be issued outside a Tokio runtime.
    pub fn query<R: Resource>(
        &self,
        request: Request<R, C>,
        on_change: Option<OnChange<R::Data>>,
    ) -> Result<QueryOutcome<R::Data>, QueryError> {
        if on_change.is_some() {
            ensure_subscribable(&request)?;
        }

        let request_id = request.request_id();
        let (state, response) = self.evaluate(&request, &request_id);
        let subscription = on_change.map(|callback| {
            let initial = (state.data.clone(), state.error.clone());
            self.subscribe_query(request, request_id, initial, Delivery::Callback(callback))
        });

        Ok(QueryOutcome {
            state,
            response,
            subscription,
        })
    }

    /// Runs `request` like [`query`](Self::query) and waits for its data.
    ///
    /// When no network request is needed the cached data (or cached error) is
    /// returned directly.
    ///
    /// # Errors
    ///
    /// Returns the network or cancellation failure of the request, the cached
    /// error, or [`QueryError::NotCached`] when the policy forbids fetching and
    /// nothing is cached.
    pub fn fetch_query<R: Resource>(
        &self,
        request: Request<R, C>,
    ) -> impl Future<Output = Result<R::Data, QueryError>> + Send + use<R, C> {
        let request_id = request.request_id();
        let cacheable = request.is_cacheable();
        let outcome = self.query(request, None);
        let client = self.clone();

        async move {
            let outcome = outcome?;
            let Some(response) = outcome.response else {
                return match (outcome.state.data, outcome.state.error) {
                    (Some(data), _) => Ok(data),
                    (None, Some(error)) => Err(error),
                    (None, None) => Err(QueryError::NotCached(request_id)),
                };
            };

            let result = response.await;
            let aborted = result.as_ref().is_err_and(QueryError::is_abort);
            if cacheable && !aborted && !client.is_in_flight(&request_id) {
                let cached = client.inner.cache.get_error(&request_id);
                let observed = result.as_ref().err();
                if cached.as_ref() != observed {
                    warn!(
                        request_id = %request_id,
                        ?observed,
                        ?cached,
                        "awaited result disagrees with the cached error"
                    );
                }
            }
            result
        }
    }

    /// Reads the current state of `request` from the cache without touching
    /// the network.
    pub fn read_query<R: Resource>(&self, request: &Request<R, C>) -> QueryState<R::Data> {
        let request_id = request.request_id();
        let (data, error) = self.read_cache(request, &request_id);
        QueryState {
            data,
            error,
            is_loading: self.is_in_flight(&request_id),
        }
    }

    /// Stream form of [`query`](Self::query) with an `on_change` callback.
    ///
    /// Emits the state as of the call, then one state per change of the cached
    /// `(data, error)` pair. Dropping the stream unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Usage`] for [`FetchPolicy::NoCache`] requests.
    pub fn watch<R: Resource>(
        &self,
        request: Request<R, C>,
    ) -> Result<BoxStream<'static, QueryState<R::Data>>, QueryError> {
        ensure_subscribable(&request)?;

        let request_id = request.request_id();
        let (state, _response) = self.evaluate(&request, &request_id);

        // The initial state is queued before the subscription exists, so no
        // later state can overtake it.
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = (state.data.clone(), state.error.clone());
        let _ = tx.send(state);
        let subscription = self.subscribe_query(request, request_id, initial, Delivery::Channel(tx));

        Ok(UnboundedReceiverStream::new(rx)
            .map(move |state| {
                let _active = &subscription;
                state
            })
            .boxed())
    }

    /// Reads `request` from the cache and issues or joins the network request
    /// its fetch policy calls for.
    fn evaluate<R: Resource>(
        &self,
        request: &Request<R, C>,
        request_id: &str,
    ) -> (QueryState<R::Data>, Option<Response<R::Data>>) {
        let (data, error) = self.read_cache(request, request_id);
        let response = (self.request_required(request, &data, &error)
            && self.request_allowed(request, &data, &error))
        .then(|| self.join_or_start(request, request_id));

        let state = QueryState {
            data,
            error,
            is_loading: response.is_some(),
        };
        (state, response)
    }

    fn read_cache<R: Resource>(
        &self,
        request: &Request<R, C>,
        request_id: &str,
    ) -> (Option<R::Data>, Option<QueryError>) {
        if request.fetch_policy == FetchPolicy::NoCache {
            return (None, None);
        }
        let data = request.from_cache.as_ref().and_then(|from_cache| {
            self.inner.cache.with_data(|cache_data| {
                from_cache(FromCache {
                    cache_data,
                    resource: &request.resource,
                    request_id,
                })
            })
        });
        (data, self.inner.cache.get_error(request_id))
    }

    fn request_required<R: Resource>(
        &self,
        request: &Request<R, C>,
        data: &Option<R::Data>,
        error: &Option<QueryError>,
    ) -> bool {
        let hydrated_from_cache = self.inner.config.optimize_on_hydrate
            && self.is_hydrating()
            && (data.is_some() || error.is_some());

        !(request.fetch_policy == FetchPolicy::CacheOnly
            || (request.fetch_policy == FetchPolicy::CacheFirst && data.is_some())
            || hydrated_from_cache)
    }

    fn request_allowed<R: Resource>(
        &self,
        request: &Request<R, C>,
        data: &Option<R::Data>,
        error: &Option<QueryError>,
    ) -> bool {
        let config = &self.inner.config;
        config.is_client
            || (!(config.disable_ssr || request.fetch_policy == FetchPolicy::NoCache)
                && data.is_none()
                && error.is_none())
    }

    fn join_or_start<R: Resource>(
        &self,
        request: &Request<R, C>,
        request_id: &str,
    ) -> Response<R::Data> {
        let (ongoing, started) = match self.inner.ongoing.entry(request_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let joined = match entry.get().downcast_ref::<Ongoing<R, C>>() {
                    Some(ongoing) => {
                        let mut state = lock(&ongoing.state);
                        if state.accepts_callers() {
                            state.record(request);
                            if request.force_request_on_merge {
                                state.should_rerun = true;
                            }
                            Some(ongoing.clone())
                        } else {
                            None
                        }
                    }
                    None => {
                        warn!(
                            request_id = %request_id,
                            "request id reused by a resource with a different data type"
                        );
                        None
                    }
                };
                match joined {
                    Some(ongoing) => {
                        debug!(request_id = %request_id, "joined in-flight request");
                        (ongoing, false)
                    }
                    None => {
                        let ongoing = self.start(request, request_id);
                        entry.insert(Box::new(ongoing.clone()));
                        (ongoing, true)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let ongoing = self.start(request, request_id);
                entry.insert(Box::new(ongoing.clone()));
                (ongoing, true)
            }
        };

        // Spawned only once registered, so the driver's cleanup always finds its entry.
        if started {
            ongoing.response.spawn();
        }
        self.wire_consumer(&ongoing.state, request);
        ongoing.response
    }

    /// Reserves the first queue slot and builds the driver. The caller
    /// registers the result before spawning it.
    fn start<R: Resource>(&self, request: &Request<R, C>, request_id: &str) -> Ongoing<R, C> {
        let op_id = self.begin_operation();
        let (token, purge_wiring) = when_any_fires([Some(&self.purge_token())]);
        let first = self.enqueue_fetch(request.resource.clone(), token.clone());

        let mut state = OngoingState {
            token,
            purge_wiring: Some(purge_wiring),
            consumer_wiring: Vec::new(),
            refcount: 0,
            mergers: Vec::new(),
            should_rerun: false,
        };
        state.record(request);
        let state = Arc::new(Mutex::new(state));

        let driver = self.clone().drive(
            request.resource.clone(),
            request_id.to_string(),
            op_id,
            state.clone(),
            first,
        );
        debug!(request_id = %request_id, op_id, "starting request");

        Ongoing {
            op_id,
            response: Response::new(driver),
            state,
        }
    }

    fn enqueue_fetch<R: Resource>(
        &self,
        resource: Arc<R>,
        token: CancelToken,
    ) -> BoxFuture<'static, Result<R::Data, QueryError>> {
        self.inner
            .queue
            .enqueue(RequestKind::Query, Some(token), move |cancel| {
                resource.fetch(cancel)
            })
            .boxed()
    }

    async fn drive<R: Resource>(
        self,
        resource: Arc<R>,
        request_id: String,
        op_id: u64,
        state: Arc<Mutex<OngoingState<R, C>>>,
        first: BoxFuture<'static, Result<R::Data, QueryError>>,
    ) -> Result<R::Data, QueryError> {
        let mut operation = first;
        let result = loop {
            let result = operation.await;

            let rerun_token = {
                let mut state = lock(&state);
                let rerun = state.should_rerun
                    && state.refcount > 0
                    && lock(&self.inner.relevant).contains(&op_id);
                if rerun {
                    let (token, purge_wiring) = when_any_fires([Some(&self.purge_token())]);
                    if let Some(previous) = state.purge_wiring.replace(purge_wiring) {
                        previous.detach();
                    }
                    state.should_rerun = false;
                    state.token = token.clone();
                    Some(token)
                } else {
                    None
                }
            };

            match rerun_token {
                Some(token) => {
                    debug!(request_id = %request_id, op_id, "rerunning request");
                    operation = self.enqueue_fetch(resource.clone(), token);
                }
                None => break result,
            }
        };

        let mergers = {
            let mut state = lock(&state);
            for wiring in state.consumer_wiring.drain(..) {
                wiring.detach();
            }
            if let Some(wiring) = state.purge_wiring.take() {
                wiring.detach();
            }
            std::mem::take(&mut state.mergers)
        };

        self.inner.ongoing.remove_if(&request_id, |_, value| {
            value
                .downcast_ref::<Ongoing<R, C>>()
                .is_some_and(|ongoing| ongoing.op_id == op_id)
        });
        let superseded = self.is_in_flight(&request_id);

        if !self.retire_operation(op_id) {
            debug!(request_id = %request_id, op_id, "request settled after purge");
        } else if superseded {
            debug!(request_id = %request_id, op_id, "request superseded, cache left to successor");
        } else if !mergers.is_empty() {
            self.write_result(&request_id, mergers, &result);
        }

        result
    }

    fn write_result<R: Resource>(
        &self,
        request_id: &str,
        mergers: Vec<Merger<R, C>>,
        result: &Result<R::Data, QueryError>,
    ) {
        let update = match result {
            Ok(data) => {
                let data = data.clone();
                let id = request_id.to_string();
                CacheUpdate::new()
                    .data(move |cache_data: &C| {
                        mergers.iter().fold(cache_data.clone(), |acc, merger| {
                            (merger.to_cache)(ToCache {
                                cache_data: &acc,
                                data: &data,
                                resource: &merger.resource,
                                request_id: &id,
                            })
                        })
                    })
                    .set_error(request_id, None)
            }
            Err(error) => CacheUpdate::new().set_error(request_id, Some(error.clone())),
        };
        self.inner.cache.update(update);
    }

    fn wire_consumer<R: Resource>(
        &self,
        state: &Arc<Mutex<OngoingState<R, C>>>,
        request: &Request<R, C>,
    ) {
        let soft_state = state.clone();
        let soft = wire_tokens(
            move || {
                let token = {
                    let mut state = lock(&soft_state);
                    state.refcount = state.refcount.saturating_sub(1);
                    debug!(refcount = state.refcount, "caller withdrew from request");
                    if state.refcount == 0 {
                        state.should_rerun = false;
                        Some(state.token.clone())
                    } else {
                        None
                    }
                };
                if let Some(token) = token {
                    token.fire();
                }
            },
            [request.soft_abort.as_ref()],
        );

        let hard_state = state.clone();
        let hard = wire_tokens(
            move || {
                let token = lock(&hard_state).token.clone();
                token.fire();
            },
            [request.abort.as_ref()],
        );

        let mut state = lock(state);
        state.consumer_wiring.push(soft);
        state.consumer_wiring.push(hard);
    }

    fn subscribe_query<R: Resource>(
        &self,
        request: Request<R, C>,
        request_id: String,
        initial: (Option<R::Data>, Option<QueryError>),
        delivery: Delivery<R::Data>,
    ) -> CacheSubscription {
        let client: Weak<ClientInner<C>> = Arc::downgrade(&self.inner);
        let last = Mutex::new(initial);

        // The cache is read while `last` is held, so concurrent checks observe
        // cache states in order.
        let check = Arc::new(move || {
            let Some(inner) = client.upgrade() else {
                return;
            };
            let client = Client { inner };
            let mut seen = lock(&last);
            let current = client.read_cache(&request, &request_id);
            if *seen == current {
                return;
            }
            *seen = current.clone();

            let state = QueryState {
                data: current.0,
                error: current.1,
                is_loading: client.is_in_flight(&request_id),
            };
            match &delivery {
                Delivery::Channel(tx) => {
                    let _ = tx.send(state);
                }
                Delivery::Callback(on_change) => {
                    // Callbacks may write to the cache, which re-enters this check.
                    drop(seen);
                    on_change(state);
                }
            }
        });

        let subscription = self.inner.cache.subscribe({
            let check = check.clone();
            move || check()
        });
        // Picks up writes that landed between the initial read and registration.
        check();
        subscription
    }
}

fn ensure_subscribable<R: Resource, C>(request: &Request<R, C>) -> Result<(), QueryError> {
    if request.fetch_policy == FetchPolicy::NoCache {
        return Err(QueryError::usage(
            "cannot subscribe to a query with the no-cache fetch policy",
        ));
    }
    Ok(())
}
