use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Teardown = Box<dyn FnOnce() + Send>;

struct SubscriptionState {
    disposed: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

/// A handle whose teardown runs exactly once, when [`Subscription::dispose`]
/// is first called. Clones share the same state, so a clone captured inside a
/// delivery task observes disposal performed on the handle returned to the
/// caller.
///
/// Disposal is explicit rather than drop-driven: handles are cloned across
/// threads and into the engine's handle registry, and only a deliberate
/// `dispose()` (or engine shutdown) may tear the subscription down.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            state: Arc::new(SubscriptionState {
                disposed: AtomicBool::new(false),
                teardown: Mutex::new(Some(Box::new(teardown))),
            }),
        }
    }

    /// A handle with no teardown, used where only the disposed flag matters.
    pub fn noop() -> Self {
        Subscription {
            state: Arc::new(SubscriptionState {
                disposed: AtomicBool::new(false),
                teardown: Mutex::new(None),
            }),
        }
    }

    /// Creates a handle whose teardown is assigned later via [`assign`].
    ///
    /// [`assign`]: Subscription::assign
    pub fn pending() -> Self {
        Self::noop()
    }

    /// Single assignment of the teardown. If the handle was disposed before
    /// the teardown arrived, it runs immediately: there is no window in which
    /// a disposed handle keeps live resources.
    pub fn assign(&self, teardown: impl FnOnce() + Send + 'static) {
        if self.state.disposed.load(Ordering::SeqCst) {
            teardown();
            return;
        }
        let mut slot = self.state.teardown.lock();
        if self.state.disposed.load(Ordering::SeqCst) {
            drop(slot);
            teardown();
        } else {
            *slot = Some(Box::new(teardown));
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let teardown = self.state.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A slot holding at most one inner [`Subscription`], replaceable over time.
/// Resubscription swaps the broken subscription for the fresh one atomically:
/// the previous handle is returned for disposal only after the new one is
/// installed, so there is never a window with zero active subscriptions.
#[derive(Clone)]
pub struct SerialSubscription {
    state: Arc<SerialState>,
}

struct SerialState {
    disposed: AtomicBool,
    current: Mutex<Option<Subscription>>,
}

impl SerialSubscription {
    pub fn new() -> Self {
        SerialSubscription {
            state: Arc::new(SerialState {
                disposed: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Installs `next` and returns the previously-held subscription, if any.
    /// When the slot is already disposed, `next` is disposed immediately.
    pub fn replace(&self, next: Subscription) -> Option<Subscription> {
        let mut current = self.state.current.lock();
        if self.state.disposed.load(Ordering::SeqCst) {
            drop(current);
            next.dispose();
            return None;
        }
        current.replace(next)
    }

    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.state.current.lock().take();
        if let Some(current) = current {
            current.dispose();
        }
    }
}

impl Default for SerialSubscription {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispose_runs_teardown_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.dispose();
        sub.dispose();

        assert!(sub.is_disposed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn assign_after_dispose_runs_teardown_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::pending();
        sub.dispose();

        let counter = calls.clone();
        sub.assign(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serial_replace_returns_previous_subscription() {
        let serial = SerialSubscription::new();
        let first_disposed = Arc::new(AtomicBool::new(false));
        let flag = first_disposed.clone();
        let first = Subscription::new(move || flag.store(true, Ordering::SeqCst));

        assert!(serial.replace(first).is_none());
        let previous = serial.replace(Subscription::noop()).expect("previous");
        previous.dispose();

        assert!(first_disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn serial_disposes_replacement_after_dispose() {
        let serial = SerialSubscription::new();
        serial.dispose();

        let late = Subscription::noop();
        serial.replace(late.clone());

        assert!(late.is_disposed());
    }
}
