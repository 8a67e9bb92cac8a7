//! Cooperative cancellation primitives.
//!
//! Two one-shot token kinds are provided:
//!
//! - [`CancelToken`]: fires once to cut short in-flight work. Late listeners run
//!   immediately if the token has already fired.
//! - [`Gate`]: starts closed and opens once, releasing everything waiting on it.
//!
//! Both expose a callback side ([`CancelToken::on_fire`], [`Gate::on_open`]) that
//! runs listeners synchronously on the firing call, and an awaitable side backed
//! by [`tokio_util::sync::CancellationToken`].
//!
//! Listeners run on the thread that fires the token, after the token's own state
//! has been updated. Never fire a token while holding a lock that one of its
//! listeners may take.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::lock;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TriggerState {
    fired: bool,
    next_id: u64,
    listeners: Vec<(u64, Callback)>,
}

/// Shared core of both token kinds.
#[derive(Default)]
struct Trigger {
    state: Mutex<TriggerState>,
    token: CancellationToken,
}

impl Trigger {
    fn fire(&self) -> bool {
        let listeners = {
            let mut state = lock(&self.state);
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.listeners)
        };
        self.token.cancel();
        for (_, callback) in listeners {
            callback();
        }
        true
    }

    fn is_fired(&self) -> bool {
        lock(&self.state).fired
    }

    fn listen(self: &Arc<Self>, callback: Callback) -> Listener {
        let mut state = lock(&self.state);
        if state.fired {
            drop(state);
            callback();
            return Listener::detached();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, callback));
        Listener {
            trigger: Arc::downgrade(self),
            id: Some(id),
        }
    }

    fn remove(&self, id: u64) {
        lock(&self.state).listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle keeps the listener registered; call [`Listener::detach`]
/// to remove it before the token fires.
#[must_use = "dropping a Listener keeps the callback registered; call detach() to remove it"]
pub struct Listener {
    trigger: Weak<Trigger>,
    id: Option<u64>,
}

impl Listener {
    const fn detached() -> Self {
        Self {
            trigger: Weak::new(),
            id: None,
        }
    }

    /// Removes the callback if it has not run yet.
    pub fn detach(self) {
        if let (Some(id), Some(trigger)) = (self.id, self.trigger.upgrade()) {
            trigger.remove(id);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

/// A one-shot cancellation signal.
///
/// Cloning yields another handle to the same signal.
///
/// # Example
///
/// ```
/// use sluice::token::CancelToken;
///
/// let token = CancelToken::new();
/// assert!(!token.is_fired());
///
/// assert!(token.fire());
/// assert!(!token.fire()); // idempotent
/// assert!(token.is_fired());
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    trigger: Arc<Trigger>,
}

impl CancelToken {
    /// Creates a token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        self.trigger.fire()
    }

    /// Returns `true` once the token has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.trigger.is_fired()
    }

    /// Registers a callback that runs at most once, when the token fires.
    ///
    /// If the token has already fired the callback runs before this returns.
    pub fn on_fire(&self, callback: impl FnOnce() + Send + 'static) -> Listener {
        self.trigger.listen(Box::new(callback))
    }

    /// Completes once the token fires.
    pub fn fired(&self) -> WaitForCancellationFutureOwned {
        self.trigger.token.clone().cancelled_owned()
    }

    /// Returns `true` if both handles refer to the same signal.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.trigger, &other.trigger)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// A one-shot "start" signal. Closed until [`Gate::open`] is called.
#[derive(Clone, Default)]
pub struct Gate {
    trigger: Arc<Trigger>,
}

impl Gate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gate that is already open.
    #[must_use]
    pub fn opened() -> Self {
        let gate = Self::new();
        gate.open();
        gate
    }

    /// Opens the gate, releasing every waiter. Returns `false` if already open.
    pub fn open(&self) -> bool {
        self.trigger.fire()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.trigger.is_fired()
    }

    /// Registers a callback that runs once the gate opens, or immediately if it
    /// already is.
    pub fn on_open(&self, callback: impl FnOnce() + Send + 'static) -> Listener {
        self.trigger.listen(Box::new(callback))
    }

    /// Completes once the gate is open.
    pub fn wait(&self) -> WaitForCancellationFutureOwned {
        self.trigger.token.clone().cancelled_owned()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").field("open", &self.is_open()).finish()
    }
}

/// The listeners attached by [`wire_tokens`].
#[derive(Debug, Default)]
#[must_use = "dropping a Wiring keeps every callback registered; call detach() to remove them"]
pub struct Wiring {
    listeners: Vec<Listener>,
}

impl Wiring {
    /// Detaches every callback that has not run yet.
    pub fn detach(self) {
        for listener in self.listeners {
            listener.detach();
        }
    }

    /// Number of distinct tokens the callback was attached to.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Attaches `callback` to every present token.
///
/// The same token passed twice is only wired once, so the callback runs exactly
/// once per token event.
pub fn wire_tokens<'a, I>(callback: impl Fn() + Send + Sync + 'static, tokens: I) -> Wiring
where
    I: IntoIterator<Item = Option<&'a CancelToken>>,
{
    let callback = Arc::new(callback);
    let mut seen: Vec<&CancelToken> = Vec::new();
    let mut listeners = Vec::new();

    for token in tokens.into_iter().flatten() {
        if seen.iter().any(|t| t.same_as(token)) {
            continue;
        }
        seen.push(token);
        let callback = callback.clone();
        listeners.push(token.on_fire(move || callback()));
    }

    Wiring { listeners }
}

/// Returns a new token that fires as soon as any of `tokens` fires.
///
/// The returned [`Wiring`] holds the listeners on the source tokens; detach it
/// once the combined token is no longer needed so long-lived sources do not
/// accumulate callbacks.
pub fn when_any_fires<'a, I>(tokens: I) -> (CancelToken, Wiring)
where
    I: IntoIterator<Item = Option<&'a CancelToken>>,
{
    let combined = CancelToken::new();
    let target = combined.clone();
    let wiring = wire_tokens(
        move || {
            target.fire();
        },
        tokens,
    );
    (combined, wiring)
}
