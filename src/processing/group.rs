//! A processing group: the concurrency compartment message callbacks run in.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::contract::{BinaryMessage, Destination, RawAck};
use crate::error::Result;
use crate::transport::MessagingSession;
use crate::utils::Subscription;

use super::scheduling::{CurrentThreadStrategy, PooledStrategy, SchedulingStrategy};

/// Declarative configuration for one processing group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingGroupInfo {
    /// 0 runs callbacks on the transport delivery thread; N > 0 runs them on
    /// a dedicated pool of N threads.
    pub concurrency_level: u32,
    /// Bound of each priority lane in the pooled case.
    pub queue_capacity: usize,
}

impl Default for ProcessingGroupInfo {
    fn default() -> Self {
        ProcessingGroupInfo {
            concurrency_level: 0,
            queue_capacity: 1024,
        }
    }
}

impl ProcessingGroupInfo {
    pub fn with_concurrency(concurrency_level: u32) -> Self {
        ProcessingGroupInfo {
            concurrency_level,
            ..Default::default()
        }
    }
}

/// Counters snapshot for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingGroupStats {
    pub name: String,
    pub concurrency_level: u32,
    pub received: u64,
    pub processed: u64,
    pub sent: u64,
}

pub(crate) type DeliveryCallback = Arc<dyn Fn(BinaryMessage, RawAck) + Send + Sync>;

pub(crate) struct ProcessingGroup {
    name: String,
    concurrency_level: u32,
    strategy: Box<dyn SchedulingStrategy>,
    disposing: AtomicBool,
    in_flight: Mutex<u64>,
    idle: Condvar,
    received: AtomicU64,
    processed: AtomicU64,
    sent: AtomicU64,
}

impl ProcessingGroup {
    pub(crate) fn new(name: &str, info: &ProcessingGroupInfo) -> Result<Self> {
        let strategy: Box<dyn SchedulingStrategy> = if info.concurrency_level == 0 {
            Box::new(CurrentThreadStrategy)
        } else {
            Box::new(PooledStrategy::new(
                name,
                info.concurrency_level,
                info.queue_capacity,
            )?)
        };
        debug!(
            group = name,
            concurrency = info.concurrency_level,
            "created processing group"
        );
        Ok(ProcessingGroup {
            name: name.to_string(),
            concurrency_level: info.concurrency_level,
            strategy,
            disposing: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn concurrency_level(&self) -> u32 {
        self.concurrency_level
    }

    /// Transport session name for this group at `priority`. Zero-concurrency
    /// groups share one session; pooled groups get one session per priority,
    /// which keeps a slow low-priority drain from stalling urgent traffic at
    /// the transport level too.
    pub(crate) fn session_name(&self, priority: u32) -> String {
        if self.concurrency_level == 0 {
            self.name.clone()
        } else {
            format!("{} priority{}", self.name, priority)
        }
    }

    /// Subscribes on the session, routing each delivery through this group's
    /// scheduling strategy.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        session: &Arc<dyn MessagingSession>,
        destination: &Destination,
        callback: DeliveryCallback,
        priority: u32,
        message_type: Option<&str>,
    ) -> Result<Subscription> {
        let queue = self.strategy.worker_queue(priority)?;
        let handle = Subscription::pending();

        let group = self.clone();
        let task_handle = handle.clone();
        let inner = session.subscribe(
            destination,
            Box::new(move |message, raw_ack| {
                group.received.fetch_add(1, Ordering::SeqCst);
                if !group.try_begin_task() {
                    raw_ack(false);
                    return;
                }
                let task_group = group.clone();
                let task_subscription = task_handle.clone();
                let task_callback = callback.clone();
                queue.execute(Box::new(move || {
                    // A message already queued when the subscription died is
                    // returned to the transport instead of being processed.
                    if task_subscription.is_disposed() || task_group.disposing.load(Ordering::SeqCst)
                    {
                        raw_ack(false);
                    } else {
                        task_callback(message, raw_ack);
                        task_group.processed.fetch_add(1, Ordering::SeqCst);
                    }
                    task_group.end_task();
                }));
            }),
            message_type,
        )?;
        handle.assign(move || inner.dispose());
        Ok(handle)
    }

    pub(crate) fn send(
        &self,
        session: &Arc<dyn MessagingSession>,
        destination: &Destination,
        message: BinaryMessage,
        ttl_ms: Option<u64>,
    ) -> Result<()> {
        session.send(destination, message, ttl_ms)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn stats(&self) -> ProcessingGroupStats {
        ProcessingGroupStats {
            name: self.name.clone(),
            concurrency_level: self.concurrency_level,
            received: self.received.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            sent: self.sent.load(Ordering::SeqCst),
        }
    }

    /// Registers a delivery as in flight, unless the group is already
    /// disposing. The disposing check and the increment share the in-flight
    /// lock, so a delivery can never slip past a dispose that has observed
    /// zero in-flight work.
    fn try_begin_task(&self) -> bool {
        let mut in_flight = self.in_flight.lock();
        if self.disposing.load(Ordering::SeqCst) {
            return false;
        }
        *in_flight += 1;
        true
    }

    fn end_task(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Stops accepting deliveries, waits for queued work to finish, then
    /// tears the worker pool down.
    pub(crate) fn dispose(&self) {
        {
            let mut in_flight = self.in_flight.lock();
            if self.disposing.swap(true, Ordering::SeqCst) {
                return;
            }
            while *in_flight > 0 {
                self.idle.wait(&mut in_flight);
            }
        }
        self.strategy.dispose();
        info!(group = %self.name, "processing group disposed");
    }
}
