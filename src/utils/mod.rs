//! Shared primitives: fire-once callbacks, disposal handles, in-flight call
//! tracking, and the delay-driven background scheduler used by the deferred
//! acknowledgement, resubscription, and request timeout subsystems.

mod scheduler;
mod subscription;
mod tracker;

pub use scheduler::DelayQueue;
pub use subscription::{SerialSubscription, Subscription};
pub(crate) use tracker::CountingTracker;

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared callback invoked when a transport or session fails.
pub type FailureHook = Arc<dyn Fn() + Send + Sync>;

/// Wraps an action so that concurrent or repeated invocations run it exactly
/// once. Duplicate failure signals for one session collapse into a single
/// resubscription trigger through this wrapper.
pub fn call_only_once(action: impl FnOnce() + Send + 'static) -> FailureHook {
    let slot: Mutex<Option<Box<dyn FnOnce() + Send>>> = Mutex::new(Some(Box::new(action)));
    Arc::new(move || {
        let action = slot.lock().take();
        if let Some(action) = action {
            action();
        }
    })
}
