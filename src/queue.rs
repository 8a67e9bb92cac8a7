//! Ordering and coalescing of concurrent operations.
//!
//! The queue is a FIFO of *slots*. Each slot owns one start [`Gate`] and counts
//! the operations still pending inside it:
//!
//! - A query enqueued while the tail slot holds queries joins that slot. It
//!   shares the slot's gate, so it starts alongside its neighbours and never
//!   waits for them to finish.
//! - A mutation always gets a slot of its own, and so does the first query
//!   after a mutation. A new slot's gate opens only once every slot ahead of it
//!   has settled, or immediately if the queue was empty.
//!
//! When the last operation of the head slot settles, the head is removed
//! together with any following slots already marked `resolved_early`, and the
//! new head's gate opens. A slot that empties while it is not the head (its
//! operations were cancelled before they could start) is only marked
//! `resolved_early`; each caller still receives its own outcome the moment it
//! settles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::deferred::{DeferredOptions, deferred};
use crate::error::QueryError;
use crate::lock;
use crate::token::{CancelToken, Gate};

/// The kind of operation occupying a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Query,
    Mutation,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    kind: RequestKind,
    gate: Gate,
    pending: usize,
    resolved_early: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: VecDeque<Slot>,
    next_id: u64,
}

/// A FIFO request queue. Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    state: Arc<Mutex<QueueState>>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an execution slot for `factory` and returns the operation.
    ///
    /// The reservation happens synchronously, so submission order is the order
    /// of `enqueue` calls, not the order in which the returned futures are
    /// first polled. The factory starts once its slot's gate opens; `cancel`
    /// rejects the operation with [`QueryError::Aborted`] whether it is still
    /// waiting or already running.
    ///
    /// The slot is released when the returned future completes or is dropped.
    pub fn enqueue<T, F, Fut>(
        &self,
        kind: RequestKind,
        cancel: Option<CancelToken>,
        factory: F,
    ) -> impl Future<Output = Result<T, QueryError>> + use<T, F, Fut>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let (slot_id, gate) = self.reserve(kind);
        let release = Release {
            queue: self.clone(),
            slot_id,
        };

        let options = DeferredOptions {
            start: Some(gate),
            cancel,
        };
        async move {
            let _release = release;
            deferred(factory, options).await
        }
    }

    fn reserve(&self, kind: RequestKind) -> (u64, Gate) {
        let mut state = lock(&self.state);

        if kind == RequestKind::Query {
            if let Some(tail) = state.slots.back_mut() {
                if tail.kind == RequestKind::Query && !tail.resolved_early {
                    tail.pending += 1;
                    return (tail.id, tail.gate.clone());
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let gate = if state.slots.is_empty() {
            Gate::opened()
        } else {
            Gate::new()
        };
        state.slots.push_back(Slot {
            id,
            kind,
            gate: gate.clone(),
            pending: 1,
            resolved_early: false,
        });
        (id, gate)
    }

    fn release(&self, slot_id: u64) {
        let next_gate = {
            let mut state = lock(&self.state);
            let Some(index) = state.slots.iter().position(|slot| slot.id == slot_id) else {
                return;
            };

            let slot = &mut state.slots[index];
            slot.pending = slot.pending.saturating_sub(1);
            if slot.pending > 0 {
                return;
            }

            if index != 0 {
                slot.resolved_early = true;
                debug!(slot = slot_id, "queue slot settled ahead of head");
                return;
            }

            state.slots.pop_front();
            while state.slots.front().is_some_and(|slot| slot.resolved_early) {
                state.slots.pop_front();
            }
            debug!(slot = slot_id, remaining = state.slots.len(), "queue slot released");
            state.slots.front().map(|slot| slot.gate.clone())
        };

        if let Some(gate) = next_gate {
            gate.open();
        }
    }

    /// Number of slots currently queued, including the running head.
    #[must_use]
    pub fn depth(&self) -> usize {
        lock(&self.state).slots.len()
    }

    /// Returns `true` if nothing is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        lock(&self.state).slots.is_empty()
    }
}

/// Releases a slot on drop, so bookkeeping runs on success, failure, abort and
/// on the operation being dropped unfinished.
struct Release {
    queue: RequestQueue,
    slot_id: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.queue.release(self.slot_id);
    }
}
