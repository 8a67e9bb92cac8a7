//! Mutation engine: optimistic writes with guaranteed rollback.
//!
//! A mutation runs in its own queue slot, after everything enqueued before
//! it. Optimistic data is written into a cache split tagged with the
//! mutation's marker before the network call starts. On settlement exactly one
//! of two things happens:
//!
//! - success: the final data is merged and the marker's splits are dropped,
//!   in one update;
//! - failure: the marker's splits are dropped, restoring the pristine lineage.
//!
//! A purge retires every marker, so a mutation settling afterwards leaves the
//! cache alone.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheUpdate, SplitMarker};
use crate::error::QueryError;
use crate::queue::RequestKind;
use crate::request::{FetchPolicy, Request, Resource, ToCache, ToCacheFn};
use crate::token::when_any_fires;

use super::{Client, Response};

impl<C> Client<C>
where
    C: Clone + Default + Send + Sync + 'static,
{
    /// Executes a mutation.
    ///
    /// Any optimistic data is visible in the cache as soon as this returns.
    /// Both `abort` and `soft_abort` tokens of the request cancel the mutation,
    /// since nobody else shares it.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Usage`] for a [`FetchPolicy::CacheOnly`] request,
    /// or when optimistic data is supplied without a `to_cache` merger.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let response = client.mutate(
    ///     Request::new(RenameTodo { id: 1, title: "new".into() })
    ///         .optimistic_data(Todo { id: 1, title: "new".into() })
    ///         .to_cache(upsert_todo),
    /// )?;
    /// // The renamed todo is already visible here.
    /// let saved = response.await?;
    /// ```
    pub fn mutate<R: Resource>(&self, request: Request<R, C>) -> Result<Response<R::Data>, QueryError> {
        if request.fetch_policy == FetchPolicy::CacheOnly {
            return Err(QueryError::usage(
                "mutations cannot run with the cache-only fetch policy",
            ));
        }
        if request.optimistic_data.is_some() && request.to_cache.is_none() {
            return Err(QueryError::usage(
                "optimistic data requires a to_cache merger",
            ));
        }

        let request_id = request.request_id();
        let marker = SplitMarker(self.begin_operation());

        let optimistic = match (&request.optimistic_data, &request.to_cache) {
            (Some(data), Some(to_cache)) if request.fetch_policy != FetchPolicy::NoCache => {
                self.inner.cache.update(
                    merge(to_cache.clone(), request.resource.clone(), &request_id, data.clone())
                        .create_split_for(marker),
                );
                debug!(request_id = %request_id, marker = marker.0, "applied optimistic data");
                true
            }
            _ => false,
        };

        let (token, wiring) = when_any_fires([
            Some(&self.purge_token()),
            request.abort.as_ref(),
            request.soft_abort.as_ref(),
        ]);
        let resource = request.resource.clone();
        let operation = self
            .inner
            .queue
            .enqueue(RequestKind::Mutation, Some(token), move |cancel| {
                resource.fetch(cancel)
            });

        let client = self.clone();
        let response = Response::new(async move {
            let result = operation.await;
            wiring.detach();
            client.settle_mutation(&request, &request_id, marker, optimistic, &result);
            result
        });
        response.spawn();
        Ok(response)
    }

    fn settle_mutation<R: Resource>(
        &self,
        request: &Request<R, C>,
        request_id: &str,
        marker: SplitMarker,
        optimistic: bool,
        result: &Result<R::Data, QueryError>,
    ) {
        if !self.retire_operation(marker.0) {
            debug!(request_id = %request_id, marker = marker.0, "mutation settled after purge");
            return;
        }

        match result {
            Ok(data) => {
                let mut update = match (&request.to_cache, request.is_cacheable()) {
                    (Some(to_cache), true) => merge(
                        to_cache.clone(),
                        request.resource.clone(),
                        request_id,
                        data.clone(),
                    ),
                    _ => CacheUpdate::new(),
                };
                if optimistic {
                    update = update.clear_split_for(marker);
                }
                if request.is_cacheable() || optimistic {
                    self.inner.cache.update(update);
                }
            }
            Err(error) => {
                if optimistic {
                    debug!(
                        request_id = %request_id,
                        marker = marker.0,
                        %error,
                        "rolling back optimistic data"
                    );
                    self.inner
                        .cache
                        .update(CacheUpdate::new().clear_split_for(marker));
                }
            }
        }
    }
}

fn merge<R: Resource, C: Clone + 'static>(
    to_cache: ToCacheFn<R, C>,
    resource: Arc<R>,
    request_id: &str,
    data: R::Data,
) -> CacheUpdate<C> {
    let request_id = request_id.to_string();
    CacheUpdate::new().data(move |cache_data: &C| {
        to_cache(ToCache {
            cache_data,
            data: &data,
            resource: &resource,
            request_id: &request_id,
        })
    })
}
