//! Split-state cache.
//!
//! The cache holds one logical value plus a per-request error map. While
//! optimistic mutations are pending it also keeps a journal: every write made
//! since the oldest live optimistic write, in order, each tagged with the
//! marker of the mutation that made it or untagged for ordinary writes. The
//! pristine base never sees a tagged write.
//!
//! A split is the base with the journal entries of some set of markers (plus
//! every untagged entry) replayed on top. Readers see the split carrying every
//! live marker, which is kept materialised. Clearing marker `m` drops `m`'s
//! entries and replays the rest, which removes exactly that mutation's
//! optimistic contribution and leaves the other markers and every ordinary
//! write in place:
//!
//! ```text
//! create A  base {}    journal [A:a]             visible {a}
//! write  c  base {}    journal [A:a, c]          visible {a, c}
//! create B  base {}    journal [A:a, c, B:b]     visible {a, c, b}
//! clear  A  base {c}   journal [B:b]             visible {c, b}
//! ```
//!
//! Untagged entries at the front of the journal are folded into the base, so
//! memory and replay cost grow with the number of writes made while
//! mutations are pending, never with the number of marker combinations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::lock;

/// Identifies the optimistic write of one in-flight mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SplitMarker(pub u64);

type DataFn<C> = Box<dyn Fn(&C) -> C + Send>;
type ErrorFn = Box<dyn Fn(Option<&QueryError>) -> Option<QueryError> + Send>;
type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// A single atomic change to the cache.
///
/// Without `create_split_for`/`clear_split_for` the data and error writes
/// apply to every split. With `create_split_for` they apply only to splits
/// carrying the marker. With `clear_split_for` the marker's writes are
/// dropped first and the writes apply to what remains.
pub struct CacheUpdate<C> {
    data: Option<DataFn<C>>,
    errors: Vec<(String, ErrorFn)>,
    create_split_for: Option<SplitMarker>,
    clear_split_for: Option<SplitMarker>,
}

impl<C> Default for CacheUpdate<C> {
    fn default() -> Self {
        Self {
            data: None,
            errors: Vec::new(),
            create_split_for: None,
            clear_split_for: None,
        }
    }
}

impl<C> CacheUpdate<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the previous data of each affected split to its next data.
    ///
    /// The function may run again when an earlier optimistic write is rolled
    /// back, so it must be a pure function of its input.
    #[must_use]
    pub fn data(mut self, f: impl Fn(&C) -> C + Send + 'static) -> Self {
        self.data = Some(Box::new(f));
        self
    }

    /// Maps the previous error of `request_id` to its next error.
    #[must_use]
    pub fn error(
        mut self,
        request_id: impl Into<String>,
        f: impl Fn(Option<&QueryError>) -> Option<QueryError> + Send + 'static,
    ) -> Self {
        self.errors.push((request_id.into(), Box::new(f)));
        self
    }

    /// Replaces the error of `request_id`, clearing it with `None`.
    #[must_use]
    pub fn set_error(self, request_id: impl Into<String>, error: Option<QueryError>) -> Self {
        self.error(request_id, move |_| error.clone())
    }

    #[must_use]
    pub const fn create_split_for(mut self, marker: SplitMarker) -> Self {
        self.create_split_for = Some(marker);
        self
    }

    #[must_use]
    pub const fn clear_split_for(mut self, marker: SplitMarker) -> Self {
        self.clear_split_for = Some(marker);
        self
    }
}

impl<C> fmt::Debug for CacheUpdate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheUpdate")
            .field("writes_data", &self.data.is_some())
            .field("errors", &self.errors.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("create_split_for", &self.create_split_for)
            .field("clear_split_for", &self.clear_split_for)
            .finish()
    }
}

#[derive(Clone)]
struct Layer<C> {
    data: C,
    errors: HashMap<String, QueryError>,
}

/// A recorded write, replayable over any layer.
struct Entry<C> {
    marker: Option<SplitMarker>,
    data: Option<DataFn<C>>,
    errors: Vec<(String, ErrorFn)>,
}

impl<C> Entry<C> {
    fn is_noop(&self) -> bool {
        self.marker.is_none() && self.data.is_none() && self.errors.is_empty()
    }

    fn replay(&self, layer: &mut Layer<C>) {
        if let Some(f) = &self.data {
            layer.data = f(&layer.data);
        }
        for (id, f) in &self.errors {
            match f(layer.errors.get(id)) {
                Some(err) => {
                    layer.errors.insert(id.clone(), err);
                }
                None => {
                    layer.errors.remove(id);
                }
            }
        }
    }
}

struct Journal<C> {
    base: Layer<C>,
    entries: Vec<Entry<C>>,
    /// `base` with every entry replayed. `None` while the journal is empty.
    visible: Option<Layer<C>>,
}

impl<C: Default> Default for Journal<C> {
    fn default() -> Self {
        Self::from_base(Layer {
            data: C::default(),
            errors: HashMap::new(),
        })
    }
}

impl<C> Journal<C> {
    fn from_base(base: Layer<C>) -> Self {
        Self {
            base,
            entries: Vec::new(),
            visible: None,
        }
    }

    fn visible(&self) -> &Layer<C> {
        self.visible.as_ref().unwrap_or(&self.base)
    }

    fn markers(&self) -> BTreeSet<SplitMarker> {
        self.entries.iter().filter_map(|entry| entry.marker).collect()
    }
}

/// Computes the next journal for `update`.
fn apply<C: Clone>(mut journal: Journal<C>, update: CacheUpdate<C>) -> Journal<C> {
    let CacheUpdate {
        data,
        errors,
        create_split_for,
        clear_split_for,
    } = update;

    if let Some(marker) = clear_split_for {
        let before = journal.entries.len();
        journal.entries.retain(|entry| entry.marker != Some(marker));
        if journal.entries.len() != before {
            let settled = journal
                .entries
                .iter()
                .take_while(|entry| entry.marker.is_none())
                .count();
            for entry in journal.entries.drain(..settled) {
                entry.replay(&mut journal.base);
            }
            journal.visible = (!journal.entries.is_empty()).then(|| {
                let mut layer = journal.base.clone();
                for entry in &journal.entries {
                    entry.replay(&mut layer);
                }
                layer
            });
        }
    }

    let entry = Entry {
        marker: create_split_for,
        data,
        errors,
    };
    if entry.is_noop() {
        return journal;
    }
    if entry.marker.is_none() && journal.entries.is_empty() {
        entry.replay(&mut journal.base);
        return journal;
    }

    let visible = journal.visible.get_or_insert_with(|| journal.base.clone());
    entry.replay(visible);
    journal.entries.push(entry);
    journal
}

/// A serializable copy of the visible cache state, used to hand a cache filled
/// on one process (e.g. a server rendering pass) to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot<C> {
    pub data: C,
    pub errors: BTreeMap<String, QueryError>,
}

struct CacheInner<C> {
    journal: Mutex<Journal<C>>,
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
    next_subscriber: Mutex<u64>,
}

/// The split-state cache. Cloning yields another handle to the same cache.
///
/// # Example
///
/// ```
/// use sluice::cache::{CacheUpdate, SplitCache, SplitMarker};
///
/// type Log = Vec<&'static str>;
///
/// let cache = SplitCache::<Log>::new();
/// cache.update(CacheUpdate::new().data(|d: &Log| [d.as_slice(), &["saved"]].concat()));
///
/// let marker = SplitMarker(1);
/// cache.update(
///     CacheUpdate::new()
///         .data(|d: &Log| [d.as_slice(), &["optimistic"]].concat())
///         .create_split_for(marker),
/// );
/// assert_eq!(cache.get_data(), vec!["saved", "optimistic"]);
///
/// // Roll back
/// cache.update(CacheUpdate::new().clear_split_for(marker));
/// assert_eq!(cache.get_data(), vec!["saved"]);
/// ```
pub struct SplitCache<C> {
    inner: Arc<CacheInner<C>>,
}

impl<C> Clone for SplitCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Clone + Default> Default for SplitCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone + Default> SplitCache<C> {
    /// Creates an empty cache holding `C::default()`.
    #[must_use]
    pub fn new() -> Self {
        Self::from_journal(Journal::default())
    }

    /// Creates a cache seeded from a snapshot taken with [`SplitCache::extract`].
    #[must_use]
    pub fn from_snapshot(snapshot: CacheSnapshot<C>) -> Self {
        Self::from_journal(Journal::from_base(Layer {
            data: snapshot.data,
            errors: snapshot.errors.into_iter().collect(),
        }))
    }

    fn from_journal(journal: Journal<C>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                journal: Mutex::new(journal),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscriber: Mutex::new(0),
            }),
        }
    }

    /// Returns a copy of the visible data.
    #[must_use]
    pub fn get_data(&self) -> C {
        self.with_data(C::clone)
    }

    /// Reads the visible data without copying it.
    pub fn with_data<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&lock(&self.inner.journal).visible().data)
    }

    /// Returns the visible error recorded for `request_id`.
    #[must_use]
    pub fn get_error(&self, request_id: &str) -> Option<QueryError> {
        lock(&self.inner.journal)
            .visible()
            .errors
            .get(request_id)
            .cloned()
    }

    /// Applies `update` atomically, then notifies every subscriber once.
    pub fn update(&self, update: CacheUpdate<C>) {
        {
            let mut journal = lock(&self.inner.journal);
            let current = std::mem::take(&mut *journal);
            *journal = apply(current, update);
        }
        self.notify();
    }

    /// Drops every optimistic write, all data and every error.
    pub fn clear(&self) {
        *lock(&self.inner.journal) = Journal::default();
        self.notify();
    }

    /// Takes a serializable copy of the visible state.
    #[must_use]
    pub fn extract(&self) -> CacheSnapshot<C> {
        let journal = lock(&self.inner.journal);
        let visible = journal.visible();
        CacheSnapshot {
            data: visible.data.clone(),
            errors: visible
                .errors
                .iter()
                .map(|(id, err)| (id.clone(), err.clone()))
                .collect(),
        }
    }
}

impl<C> SplitCache<C> {
    /// Number of lineages held: the pristine one plus one per live marker.
    #[must_use]
    pub fn split_count(&self) -> usize {
        1 + lock(&self.inner.journal).markers().len()
    }

    /// Number of writes kept for replay while optimistic writes are pending.
    #[must_use]
    pub fn journal_len(&self) -> usize {
        lock(&self.inner.journal).entries.len()
    }

    /// Returns `true` if an optimistic write tagged with `marker` is live.
    #[must_use]
    pub fn has_marker(&self, marker: SplitMarker) -> bool {
        lock(&self.inner.journal)
            .entries
            .iter()
            .any(|entry| entry.marker == Some(marker))
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn notify(&self) {
        // Subscribers may read or update the cache, so none of its locks are held here.
        let subscribers: Vec<Subscriber> = lock(&self.inner.subscribers).values().cloned().collect();
        for subscriber in subscribers {
            subscriber();
        }
    }
}

impl<C: Send + 'static> SplitCache<C> {
    /// Registers `callback` to run after every update.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> CacheSubscription {
        let id = {
            let mut next = lock(&self.inner.next_subscriber);
            let id = *next;
            *next += 1;
            id
        };
        lock(&self.inner.subscribers).insert(id, Arc::new(callback));

        let weak: Weak<CacheInner<C>> = Arc::downgrade(&self.inner);
        CacheSubscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.subscribers).remove(&id);
                }
            })),
        }
    }
}

impl<C> fmt::Debug for SplitCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let journal = lock(&self.inner.journal);
        f.debug_struct("SplitCache")
            .field("markers", &journal.markers())
            .field("journal", &journal.entries.len())
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .finish()
    }
}

/// Handle returned by [`SplitCache::subscribe`].
///
/// Dropping it unsubscribes.
pub struct CacheSubscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CacheSubscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSubscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
