use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Raw accept/reject decision for one delivery, applied immediately.
/// Produced by the transport session; consumed exactly once.
pub type RawAck = Box<dyn FnOnce(bool) + Send>;

type DeferredAck = Box<dyn FnOnce(u64, bool) + Send>;

/// The acknowledge contract handed to message callbacks: a fire-once decision
/// taking `(delay_ms, accept)`. Delay 0 applies the decision immediately;
/// a positive delay defers it to no earlier than `now + delay_ms`.
///
/// The wrapper is idempotent — the first call wins and later calls are
/// ignored — so a handler that settles the message and then fails cannot
/// double-settle it.
#[derive(Clone)]
pub struct Acknowledge {
    inner: Arc<AckState>,
}

struct AckState {
    settled: AtomicBool,
    apply: Mutex<Option<DeferredAck>>,
}

impl Acknowledge {
    pub fn new(apply: impl FnOnce(u64, bool) + Send + 'static) -> Self {
        Acknowledge {
            inner: Arc::new(AckState {
                settled: AtomicBool::new(false),
                apply: Mutex::new(Some(Box::new(apply))),
            }),
        }
    }

    /// Accepts or rejects the delivery after `delay_ms` milliseconds.
    pub fn done(&self, delay_ms: u64, accept: bool) {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let apply = self.inner.apply.lock().take();
        if let Some(apply) = apply {
            apply(delay_ms, accept);
        }
    }

    /// Accepts the delivery immediately.
    pub fn accept(&self) {
        self.done(0, true);
    }

    /// Rejects the delivery immediately.
    pub fn reject(&self) {
        self.done(0, false);
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledge")
            .field("settled", &self.is_settled())
            .finish()
    }
}
