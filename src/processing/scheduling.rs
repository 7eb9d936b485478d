//! Execution strategies behind processing groups.
//!
//! Concurrency level 0 runs callbacks inline on the transport's delivery
//! thread, which preserves per-destination ordering. A positive level runs a
//! fixed pool of named worker threads draining priority lanes: lower numeric
//! priority drains first, and each lane is bounded, so a producer that
//! outruns the pool blocks instead of growing the queue without limit.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::{MessagingError, Result};

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Sink for delivery tasks at one priority.
pub(crate) trait WorkQueue: Send + Sync {
    /// Blocks when the queue is at capacity.
    fn execute(&self, task: Task);
}

/// Maps priorities to work queues for one processing group.
pub(crate) trait SchedulingStrategy: Send + Sync {
    fn worker_queue(&self, priority: u32) -> Result<Arc<dyn WorkQueue>>;
    fn dispose(&self);
}

/// Zero-concurrency strategy: tasks run where they are submitted.
pub(crate) struct CurrentThreadStrategy;

struct InlineQueue;

impl WorkQueue for InlineQueue {
    fn execute(&self, task: Task) {
        task();
    }
}

impl SchedulingStrategy for CurrentThreadStrategy {
    fn worker_queue(&self, priority: u32) -> Result<Arc<dyn WorkQueue>> {
        if priority != 0 {
            return Err(MessagingError::InvalidSubscription {
                message: format!(
                    "priority {priority} requires a concurrency level greater than 0"
                ),
            });
        }
        Ok(Arc::new(InlineQueue))
    }

    fn dispose(&self) {}
}

struct PoolState {
    lanes: BTreeMap<u32, VecDeque<Task>>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    lane_capacity: usize,
}

impl PoolShared {
    fn pop_next(state: &mut PoolState) -> Option<Task> {
        // BTreeMap iterates keys ascending, so the lowest priority value wins.
        for lane in state.lanes.values_mut() {
            if let Some(task) = lane.pop_front() {
                return Some(task);
            }
        }
        None
    }
}

/// Fixed pool of worker threads over bounded priority lanes.
pub(crate) struct PooledStrategy {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PooledStrategy {
    pub(crate) fn new(
        group_name: &str,
        thread_count: u32,
        lane_capacity: usize,
    ) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                lanes: BTreeMap::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            lane_capacity,
        });

        let mut threads = Vec::with_capacity(thread_count as usize);
        for i in 0..thread_count {
            let worker_shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{group_name}-worker-{i}"))
                .spawn(move || Self::worker_loop(worker_shared));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(cause) => {
                    // Stop the workers that did start before bailing out.
                    shared.state.lock().shutdown = true;
                    shared.not_empty.notify_all();
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(MessagingError::Processing {
                        message: format!("failed to spawn worker thread: {cause}"),
                    });
                }
            }
        }

        Ok(PooledStrategy {
            shared,
            threads: Mutex::new(threads),
        })
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        let mut state = shared.state.lock();
        loop {
            match PoolShared::pop_next(&mut state) {
                Some(task) => {
                    shared.not_full.notify_all();
                    drop(state);
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("delivery task panicked");
                    }
                    state = shared.state.lock();
                }
                // Remaining tasks are drained before shutdown takes effect.
                None if state.shutdown => return,
                None => shared.not_empty.wait(&mut state),
            }
        }
    }
}

struct PooledQueue {
    shared: Arc<PoolShared>,
    priority: u32,
}

impl WorkQueue for PooledQueue {
    fn execute(&self, task: Task) {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                // The pool is gone; run on the caller so the task can still
                // settle its acknowledgement instead of vanishing.
                drop(state);
                task();
                return;
            }
            let lane = state.lanes.entry(self.priority).or_default();
            if lane.len() < self.shared.lane_capacity {
                lane.push_back(task);
                self.shared.not_empty.notify_one();
                return;
            }
            self.shared.not_full.wait(&mut state);
        }
    }
}

impl SchedulingStrategy for PooledStrategy {
    fn worker_queue(&self, priority: u32) -> Result<Arc<dyn WorkQueue>> {
        Ok(Arc::new(PooledQueue {
            shared: self.shared.clone(),
            priority,
        }))
    }

    fn dispose(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    #[test]
    fn current_thread_strategy_rejects_priorities() {
        let strategy = CurrentThreadStrategy;
        assert!(strategy.worker_queue(0).is_ok());
        assert!(matches!(
            strategy.worker_queue(1),
            Err(MessagingError::InvalidSubscription { .. })
        ));
    }

    #[test]
    fn current_thread_queue_runs_inline() {
        let strategy = CurrentThreadStrategy;
        let queue = strategy.worker_queue(0).unwrap();
        let caller = std::thread::current().id();
        let (tx, rx) = crossbeam::channel::bounded(1);
        queue.execute(Box::new(move || {
            let _ = tx.send(std::thread::current().id());
        }));
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn pool_uses_the_configured_number_of_threads() {
        let strategy = PooledStrategy::new("pool-size", 3, 16).unwrap();
        let queue = strategy.worker_queue(0).unwrap();

        // All three workers must show up at the barrier, which cannot happen
        // with fewer threads.
        let barrier = Arc::new(Barrier::new(4));
        let names = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let barrier = barrier.clone();
            let names = names.clone();
            queue.execute(Box::new(move || {
                names
                    .lock()
                    .push(std::thread::current().name().map(str::to_string));
                barrier.wait();
            }));
        }
        barrier.wait();

        let names = names.lock();
        assert_eq!(names.len(), 3);
        for name in names.iter() {
            assert!(name.as_deref().unwrap_or("").starts_with("pool-size-worker-"));
        }
        strategy.dispose();
    }

    #[test]
    fn lower_priority_value_drains_first() {
        let strategy = PooledStrategy::new("pool-prio", 1, 16).unwrap();
        let gate = Arc::new(Barrier::new(2));

        // Park the single worker so the lanes fill while it is busy.
        let parked = gate.clone();
        strategy
            .worker_queue(0)
            .unwrap()
            .execute(Box::new(move || {
                parked.wait();
            }));

        let order = Arc::new(Mutex::new(Vec::new()));
        for priority in [2u32, 1, 0] {
            let order = order.clone();
            strategy
                .worker_queue(priority)
                .unwrap()
                .execute(Box::new(move || {
                    order.lock().push(priority);
                }));
        }

        gate.wait();
        strategy.dispose(); // joins the worker after it drains the lanes
        assert_eq!(order.lock().as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn full_lane_blocks_the_producer() {
        let strategy = PooledStrategy::new("pool-full", 1, 1).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let parked = gate.clone();
        let queue = strategy.worker_queue(0).unwrap();
        queue.execute(Box::new(move || {
            parked.wait();
        }));
        queue.execute(Box::new(|| {})); // fills the single slot

        let done = Arc::new(AtomicUsize::new(0));
        let producer_done = done.clone();
        let producer_queue = strategy.worker_queue(0).unwrap();
        let producer = std::thread::spawn(move || {
            producer_queue.execute(Box::new(|| {}));
            producer_done.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        let blocked_since = Instant::now();
        gate.wait();
        producer.join().unwrap();
        assert!(blocked_since.elapsed() < Duration::from_secs(1));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        strategy.dispose();
    }

    #[test]
    fn execute_after_shutdown_runs_the_task_inline() {
        let strategy = PooledStrategy::new("pool-late", 1, 4).unwrap();
        let queue = strategy.worker_queue(0).unwrap();
        strategy.dispose();

        let (tx, rx) = crossbeam::channel::bounded(1);
        queue.execute(Box::new(move || {
            let _ = tx.send(std::thread::current().id());
        }));
        // The task ran, on the submitting thread, instead of being dropped.
        assert_eq!(rx.try_recv().unwrap(), std::thread::current().id());
    }

    #[test]
    fn worker_survives_a_panicking_task() {
        let strategy = PooledStrategy::new("pool-panic", 1, 16).unwrap();
        let queue = strategy.worker_queue(0).unwrap();
        queue.execute(Box::new(|| panic!("boom")));

        let (tx, rx) = crossbeam::channel::bounded(1);
        queue.execute(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        strategy.dispose();
    }
}
