use parking_lot::{Condvar, Mutex};

/// Reference-counting guard over in-flight public calls. Shutdown waits for
/// the count to reach zero before tearing the managers down.
pub(crate) struct CountingTracker {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountingTracker {
    pub fn new() -> Self {
        CountingTracker {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    pub fn track(&self) -> TrackerGuard<'_> {
        *self.count.lock() += 1;
        TrackerGuard { tracker: self }
    }

    pub fn wait_all(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

pub(crate) struct TrackerGuard<'a> {
    tracker: &'a CountingTracker,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.tracker.count.lock();
        *count -= 1;
        if *count == 0 {
            self.tracker.zero.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_all_blocks_until_guards_drop() {
        let tracker = Arc::new(CountingTracker::new());
        let guard_owner = tracker.clone();
        let worker = std::thread::spawn(move || {
            let _guard = guard_owner.track();
            std::thread::sleep(Duration::from_millis(100));
        });

        std::thread::sleep(Duration::from_millis(20));
        let waited = std::time::Instant::now();
        tracker.wait_all();
        assert!(waited.elapsed() >= Duration::from_millis(50));
        worker.join().unwrap();
    }
}
