use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{MessagingError, Result};

struct WorkerState {
    next_due: Option<Instant>,
    shutdown: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

/// A background thread that runs one action whenever a scheduled wake time is
/// reached. `schedule` only ever moves the wake time earlier; the action is
/// responsible for finding the work that became due.
pub(crate) struct SchedulingBackgroundWorker {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulingBackgroundWorker {
    pub fn new(name: &str, action: impl Fn() + Send + 'static) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                next_due: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("courier-{name}"))
            .spawn(move || Self::run(loop_shared, action))
            .map_err(|cause| MessagingError::Processing {
                message: format!("failed to spawn scheduler thread: {cause}"),
            })?;

        Ok(SchedulingBackgroundWorker {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(shared: Arc<WorkerShared>, action: impl Fn()) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.next_due {
                Some(due) => {
                    let now = Instant::now();
                    if now >= due {
                        state.next_due = None;
                        drop(state);
                        action();
                        state = shared.state.lock();
                    } else {
                        shared.wake.wait_until(&mut state, due);
                    }
                }
                None => {
                    shared.wake.wait(&mut state);
                }
            }
        }
    }

    /// Requests the action to run no later than `delay` from now.
    pub fn schedule(&self, delay: Duration) {
        let due = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        if state.next_due.map_or(true, |current| due < current) {
            state.next_due = Some(due);
        }
        self.shared.wake.notify_one();
    }

    pub fn dispose(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("scheduler thread panicked during shutdown");
            }
        }
    }
}

type Deferred = (Instant, Box<dyn FnOnce() + Send>);

/// "Run this callback no earlier than T" over a single background thread.
/// One instance backs each delay-driven subsystem: deferred acknowledgements,
/// the resubscription schedule, and handler re-registration.
pub struct DelayQueue {
    entries: Arc<Mutex<Vec<Deferred>>>,
    worker: SchedulingBackgroundWorker,
}

impl DelayQueue {
    pub fn new(name: &str) -> Result<Self> {
        let entries: Arc<Mutex<Vec<Deferred>>> = Arc::new(Mutex::new(Vec::new()));
        let flush_entries = entries.clone();
        let worker =
            SchedulingBackgroundWorker::new(name, move || Self::run_ready(&flush_entries, false))?;
        Ok(DelayQueue { entries, worker })
    }

    /// Schedules `action` to run no earlier than `delay` from now.
    pub fn defer(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            action();
            return;
        }
        self.entries
            .lock()
            .push((Instant::now() + delay, Box::new(action)));
        self.worker.schedule(delay);
    }

    fn run_ready(entries: &Mutex<Vec<Deferred>>, all: bool) {
        let ready: Vec<Deferred> = {
            let mut entries = entries.lock();
            if all {
                entries.drain(..).collect()
            } else {
                let now = Instant::now();
                let mut ready = Vec::new();
                let mut i = 0;
                while i < entries.len() {
                    if entries[i].0 <= now {
                        ready.push(entries.remove(i));
                    } else {
                        i += 1;
                    }
                }
                ready
            }
        };
        for (_, action) in ready {
            action();
        }
    }

    /// Runs every pending entry immediately, regardless of due time. Used at
    /// shutdown so no deferred acknowledgement is ever silently dropped.
    pub fn flush_all(&self) {
        Self::run_ready(&self.entries, true);
    }

    /// Stops the background thread. Pending entries are flushed when
    /// `flush_pending` is set and discarded otherwise.
    pub fn dispose(&self, flush_pending: bool) {
        self.worker.dispose();
        if flush_pending {
            self.flush_all();
        } else {
            self.entries.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn deferred_action_runs_no_earlier_than_requested() {
        let queue = DelayQueue::new("test-delay").unwrap();
        let fired = Arc::new(Mutex::new(None));
        let slot = fired.clone();
        let requested = Instant::now();

        queue.defer(Duration::from_millis(200), move || {
            *slot.lock() = Some(Instant::now());
        });

        std::thread::sleep(Duration::from_millis(500));
        let fired_at = fired.lock().expect("action did not run");
        assert!(fired_at.duration_since(requested) >= Duration::from_millis(200));
        queue.dispose(false);
    }

    #[test]
    fn zero_delay_runs_inline() {
        let queue = DelayQueue::new("test-inline").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        queue.defer(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        queue.dispose(false);
    }

    #[test]
    fn flush_all_runs_entries_before_due_time() {
        let queue = DelayQueue::new("test-flush").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        queue.defer(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        queue.dispose(true);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
