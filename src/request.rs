//! Request descriptors and the resource contract.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::QueryError;
use crate::token::CancelToken;

/// Something that can be fetched or mutated over the network.
///
/// Two resources describe the same request when their
/// [`request_id`](Resource::request_id)s are equal; concurrent queries for the
/// same id share a single [`fetch`](Resource::fetch) call.
///
/// # Example
///
/// ```
/// use futures::future::BoxFuture;
/// use sluice::{QueryError, request::Resource, token::CancelToken};
///
/// struct User(u32);
///
/// impl Resource for User {
///     type Data = String;
///
///     fn request_id(&self) -> String {
///         format!("GET /users/{}", self.0)
///     }
///
///     fn fetch(&self, _cancel: CancelToken) -> BoxFuture<'static, Result<String, QueryError>> {
///         let id = self.0;
///         Box::pin(async move { Ok(format!("user {id}")) })
///     }
/// }
/// ```
pub trait Resource: Send + Sync + 'static {
    /// The data a successful fetch produces.
    type Data: Clone + PartialEq + Send + Sync + 'static;

    fn request_id(&self) -> String;

    /// Performs the network operation. `cancel` fires when every interested
    /// caller has withdrawn or the client is purged.
    fn fetch(&self, cancel: CancelToken) -> BoxFuture<'static, Result<Self::Data, QueryError>>;
}

/// Governs whether a query needs the network given the current cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchPolicy {
    /// Never fetch; only read the cache.
    CacheOnly,
    /// Fetch only when the cache has no data for the request.
    #[default]
    CacheFirst,
    /// Return cached data and always fetch.
    CacheAndNetwork,
    /// Always fetch and neither read nor write the cache.
    NoCache,
}

/// Arguments passed to a [`Request::to_cache`] merger.
pub struct ToCache<'a, R: Resource, C> {
    pub cache_data: &'a C,
    pub data: &'a R::Data,
    pub resource: &'a R,
    pub request_id: &'a str,
}

/// Arguments passed to a [`Request::from_cache`] reader.
pub struct FromCache<'a, R, C> {
    pub cache_data: &'a C,
    pub resource: &'a R,
    pub request_id: &'a str,
}

pub(crate) type ToCacheFn<R, C> = Arc<dyn Fn(ToCache<'_, R, C>) -> C + Send + Sync>;
pub(crate) type FromCacheFn<R, C> =
    Arc<dyn Fn(FromCache<'_, R, C>) -> Option<<R as Resource>::Data> + Send + Sync>;

/// A declarative request against a [`Resource`].
///
/// A fresh descriptor is built for every call.
///
/// # Example
///
/// ```ignore
/// let request = Request::new(User(1))
///     .fetch_policy(FetchPolicy::CacheAndNetwork)
///     .soft_abort(unmount_token.clone())
///     .to_cache(|args| {
///         let mut users = args.cache_data.clone();
///         users.insert(args.request_id.to_string(), args.data.clone());
///         users
///     })
///     .from_cache(|args| args.cache_data.get(args.request_id).cloned());
/// ```
pub struct Request<R: Resource, C> {
    pub(crate) resource: Arc<R>,
    pub(crate) fetch_policy: FetchPolicy,
    pub(crate) abort: Option<CancelToken>,
    pub(crate) soft_abort: Option<CancelToken>,
    pub(crate) to_cache: Option<ToCacheFn<R, C>>,
    pub(crate) from_cache: Option<FromCacheFn<R, C>>,
    pub(crate) optimistic_data: Option<R::Data>,
    pub(crate) force_request_on_merge: bool,
}

impl<R: Resource, C> Request<R, C> {
    pub fn new(resource: R) -> Self {
        Self::from_shared(Arc::new(resource))
    }

    pub fn from_shared(resource: Arc<R>) -> Self {
        Self {
            resource,
            fetch_policy: FetchPolicy::default(),
            abort: None,
            soft_abort: None,
            to_cache: None,
            from_cache: None,
            optimistic_data: None,
            force_request_on_merge: false,
        }
    }

    #[must_use]
    pub const fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    /// Aborts the underlying network call unconditionally when fired.
    #[must_use]
    pub fn abort(mut self, token: CancelToken) -> Self {
        self.abort = Some(token);
        self
    }

    /// Withdraws this caller's interest when fired. The network call is only
    /// aborted once every caller sharing it has withdrawn.
    #[must_use]
    pub fn soft_abort(mut self, token: CancelToken) -> Self {
        self.soft_abort = Some(token);
        self
    }

    /// Merges fetched data into the cache.
    #[must_use]
    pub fn to_cache(mut self, f: impl Fn(ToCache<'_, R, C>) -> C + Send + Sync + 'static) -> Self {
        self.to_cache = Some(Arc::new(f));
        self
    }

    /// Reads this request's data out of the cache.
    #[must_use]
    pub fn from_cache(
        mut self,
        f: impl Fn(FromCache<'_, R, C>) -> Option<R::Data> + Send + Sync + 'static,
    ) -> Self {
        self.from_cache = Some(Arc::new(f));
        self
    }

    /// Data written to the cache before a mutation settles.
    #[must_use]
    pub fn optimistic_data(mut self, data: R::Data) -> Self {
        self.optimistic_data = Some(data);
        self
    }

    /// When this request joins one already in flight, fetch again once that
    /// one settles so the result reflects state as of this call.
    #[must_use]
    pub const fn force_request_on_merge(mut self, force: bool) -> Self {
        self.force_request_on_merge = force;
        self
    }

    #[must_use]
    pub fn resource(&self) -> &R {
        &self.resource
    }

    #[must_use]
    pub fn request_id(&self) -> String {
        self.resource.request_id()
    }

    #[must_use]
    pub const fn policy(&self) -> FetchPolicy {
        self.fetch_policy
    }

    /// Whether results of this request are read from and written to the cache.
    pub(crate) fn is_cacheable(&self) -> bool {
        self.fetch_policy != FetchPolicy::NoCache && self.to_cache.is_some()
    }
}

impl<R: Resource, C> Clone for Request<R, C> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            fetch_policy: self.fetch_policy,
            abort: self.abort.clone(),
            soft_abort: self.soft_abort.clone(),
            to_cache: self.to_cache.clone(),
            from_cache: self.from_cache.clone(),
            optimistic_data: self.optimistic_data.clone(),
            force_request_on_merge: self.force_request_on_merge,
        }
    }
}

impl<R: Resource, C> fmt::Debug for Request<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.resource.request_id())
            .field("fetch_policy", &self.fetch_policy)
            .field("has_optimistic_data", &self.optimistic_data.is_some())
            .field("force_request_on_merge", &self.force_request_on_merge)
            .finish_non_exhaustive()
    }
}

/// The state of a query as seen by one caller.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Cached data for the request, if any.
    pub data: Option<T>,
    /// The error recorded for the request, if any.
    pub error: Option<QueryError>,
    /// Whether a network request was issued or joined by this call.
    pub is_loading: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
        }
    }
}

impl<T> QueryState<T> {
    /// Returns the data if present, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query is currently loading.
    pub const fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Returns `true` if data is present and no error is recorded.
    pub const fn is_success(&self) -> bool {
        self.data.is_some() && self.error.is_none()
    }

    /// Returns `true` if an error is recorded.
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
