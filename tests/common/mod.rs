// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sluice::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub value: String,
    pub freshness: usize,
}

pub fn record(id: &str, value: &str) -> Record {
    Record {
        id: id.to_string(),
        value: value.to_string(),
        freshness: 0,
    }
}

pub type Cache = BTreeMap<String, Record>;

pub fn cache_key(id: &str) -> String {
    format!("item/{id}")
}

/// Counts network calls and records when each one starts and ends.
#[derive(Debug, Clone, Default)]
pub struct Backend {
    calls: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    fn push(&self, event: String) {
        self.events.lock().expect("events lock").push(event);
    }

    fn respond(
        &self,
        id: &'static str,
        value: &'static str,
        delay: Duration,
        fail: bool,
    ) -> BoxFuture<'static, Result<Record, QueryError>> {
        let freshness = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.push(format!("start {id}"));

        let backend = self.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            backend.push(format!("end {id}"));
            if fail {
                Err(QueryError::Network(format!("{id} unavailable")))
            } else {
                Ok(Record {
                    id: id.to_string(),
                    value: value.to_string(),
                    freshness,
                })
            }
        })
    }
}

/// A readable item cached under `item/{id}`.
pub struct Item {
    pub id: &'static str,
    pub delay: Duration,
    pub fail: bool,
    pub backend: Backend,
}

impl Resource for Item {
    type Data = Record;

    fn request_id(&self) -> String {
        cache_key(self.id)
    }

    fn fetch(&self, _cancel: CancelToken) -> BoxFuture<'static, Result<Record, QueryError>> {
        self.backend.respond(self.id, "stored", self.delay, self.fail)
    }
}

/// A write to an item. The saved record lands under the item's key.
pub struct Save {
    pub id: &'static str,
    pub value: &'static str,
    pub delay: Duration,
    pub fail: bool,
    pub backend: Backend,
}

impl Resource for Save {
    type Data = Record;

    fn request_id(&self) -> String {
        format!("save/{}", self.id)
    }

    fn fetch(&self, _cancel: CancelToken) -> BoxFuture<'static, Result<Record, QueryError>> {
        self.backend.respond(self.id, self.value, self.delay, self.fail)
    }
}

pub fn merge_record<R: Resource<Data = Record>>(args: ToCache<'_, R, Cache>) -> Cache {
    let mut next = args.cache_data.clone();
    next.insert(cache_key(&args.data.id), args.data.clone());
    next
}

fn item(backend: &Backend, id: &'static str, delay_ms: u64, fail: bool) -> Request<Item, Cache> {
    Request::new(Item {
        id,
        delay: Duration::from_millis(delay_ms),
        fail,
        backend: backend.clone(),
    })
    .to_cache(merge_record)
    .from_cache(|args| args.cache_data.get(args.request_id).cloned())
}

pub fn item_request(
    backend: &Backend,
    id: &'static str,
    delay_ms: u64,
    policy: FetchPolicy,
) -> Request<Item, Cache> {
    item(backend, id, delay_ms, false).fetch_policy(policy)
}

pub fn failing_item_request(backend: &Backend, id: &'static str, delay_ms: u64) -> Request<Item, Cache> {
    item(backend, id, delay_ms, true).fetch_policy(FetchPolicy::CacheAndNetwork)
}

pub fn save_request(
    backend: &Backend,
    id: &'static str,
    value: &'static str,
    delay_ms: u64,
    fail: bool,
) -> Request<Save, Cache> {
    Request::new(Save {
        id,
        value,
        delay: Duration::from_millis(delay_ms),
        fail,
        backend: backend.clone(),
    })
    .to_cache(merge_record)
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
