//! Owns the processing groups and the delay-driven machinery around them:
//! deferred acknowledgements and the resubscription schedule.
//!
//! Subscriptions survive session failures. The transport layer signals a
//! failed session once; the manager then rebuilds the subscription on a fresh
//! session, quickly on the first attempt and at the resubscription timeout
//! thereafter, until it succeeds, hits a configuration error, or the
//! subscription is disposed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::contract::{Acknowledge, BinaryMessage, Destination, RawAck};
use crate::error::{MessagingError, Result};
use crate::transport::{MessagingSession, TransportManager};
use crate::utils::{call_only_once, DelayQueue, FailureHook, SerialSubscription, Subscription};

use super::group::{DeliveryCallback, ProcessingGroup, ProcessingGroupInfo, ProcessingGroupStats};

const FIRST_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_RESUBSCRIPTION_TIMEOUT_MS: u64 = 60_000;

/// Message callback at the processing layer: raw envelope plus the deferred
/// acknowledgement contract.
pub(crate) type MessageHandler = Arc<dyn Fn(BinaryMessage, Acknowledge) + Send + Sync>;

/// Hands out named sessions. Implemented by [`TransportManager`]; a seam for
/// tests.
pub(crate) trait SessionProvider: Send + Sync {
    fn session(
        &self,
        transport_id: &str,
        session_name: &str,
        on_failure: Option<FailureHook>,
    ) -> Result<Arc<dyn MessagingSession>>;
}

impl SessionProvider for TransportManager {
    fn session(
        &self,
        transport_id: &str,
        session_name: &str,
        on_failure: Option<FailureHook>,
    ) -> Result<Arc<dyn MessagingSession>> {
        self.get_messaging_session(transport_id, session_name, on_failure)
    }
}

struct SubscriptionContext {
    transport_id: String,
    destination: Destination,
    callback: MessageHandler,
    message_type: Option<String>,
    group_name: String,
    priority: u32,
    serial: SerialSubscription,
}

pub struct ProcessingGroupManager {
    sessions: Arc<dyn SessionProvider>,
    groups: Mutex<HashMap<String, Arc<ProcessingGroup>>>,
    group_infos: Mutex<HashMap<String, ProcessingGroupInfo>>,
    deferred_acks: DelayQueue,
    resubscription: DelayQueue,
    resubscription_timeout_ms: AtomicU64,
    disposing: AtomicBool,
    self_ref: Weak<ProcessingGroupManager>,
}

impl ProcessingGroupManager {
    pub(crate) fn new(sessions: Arc<dyn SessionProvider>) -> Result<Arc<Self>> {
        let deferred_acks = DelayQueue::new("deferred-acks")?;
        let resubscription = DelayQueue::new("resubscription")?;
        Ok(Arc::new_cyclic(|self_ref| ProcessingGroupManager {
            sessions,
            groups: Mutex::new(HashMap::new()),
            group_infos: Mutex::new(HashMap::new()),
            deferred_acks,
            resubscription,
            resubscription_timeout_ms: AtomicU64::new(DEFAULT_RESUBSCRIPTION_TIMEOUT_MS),
            disposing: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// Delay between failed resubscription attempts, after the first fast one.
    pub fn set_resubscription_timeout(&self, timeout: Duration) {
        self.resubscription_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Declares a group's configuration before its first use. Groups not
    /// declared here are created with the default configuration on demand.
    pub fn add_processing_group(
        &self,
        name: &str,
        info: ProcessingGroupInfo,
    ) -> Result<()> {
        if self.groups.lock().contains_key(name) || self.group_infos.lock().contains_key(name) {
            return Err(MessagingError::DuplicateProcessingGroup {
                name: name.to_string(),
            });
        }
        self.group_infos.lock().insert(name.to_string(), info);
        Ok(())
    }

    pub fn get_processing_group_info(&self, name: &str) -> Option<ProcessingGroupInfo> {
        self.group_infos.lock().get(name).cloned()
    }

    fn group(&self, name: &str) -> Result<Arc<ProcessingGroup>> {
        let mut groups = self.groups.lock();
        if let Some(existing) = groups.get(name) {
            return Ok(existing.clone());
        }
        let info = self
            .group_infos
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default();
        let created = Arc::new(ProcessingGroup::new(name, &info)?);
        groups.insert(name.to_string(), created.clone());
        Ok(created)
    }

    /// Subscribes `callback` to `destination` inside the named group. The
    /// first attempt runs synchronously; configuration errors propagate to
    /// the caller, while transient failures (then, and on later session
    /// failures) trigger automatic resubscription.
    pub(crate) fn subscribe(
        &self,
        transport_id: &str,
        destination: Destination,
        callback: MessageHandler,
        message_type: Option<String>,
        group_name: &str,
        priority: u32,
    ) -> Result<Subscription> {
        if self.disposing.load(Ordering::SeqCst) {
            return Err(MessagingError::disposed("ProcessingGroupManager"));
        }
        let ctx = Arc::new(SubscriptionContext {
            transport_id: transport_id.to_string(),
            destination,
            callback,
            message_type,
            group_name: group_name.to_string(),
            priority,
            serial: SerialSubscription::new(),
        });
        self.do_subscribe(ctx.clone(), 0)?;
        let serial = ctx.serial.clone();
        Ok(Subscription::new(move || serial.dispose()))
    }

    fn do_subscribe(&self, ctx: Arc<SubscriptionContext>, attempt: u64) -> Result<()> {
        if self.disposing.load(Ordering::SeqCst) || ctx.serial.is_disposed() {
            return Ok(());
        }

        let group = self.group(&ctx.group_name)?;
        let session_name = group.session_name(ctx.priority);

        let manager = self.self_ref.clone();
        let failed_ctx = ctx.clone();
        let on_failure = call_only_once(move || {
            if let Some(manager) = manager.upgrade() {
                warn!(
                    destination = %failed_ctx.destination,
                    "session failed, scheduling resubscription"
                );
                manager.schedule_resubscription(failed_ctx, 1);
            }
        });

        let outcome = self
            .sessions
            .session(&ctx.transport_id, &session_name, Some(on_failure))
            .and_then(|session| {
                let manager = self.self_ref.clone();
                let handler = ctx.callback.clone();
                let delivery: DeliveryCallback = Arc::new(move |message, raw_ack| {
                    let ack = match manager.upgrade() {
                        Some(manager) => manager.create_deferred_ack(raw_ack),
                        // Manager gone mid-delivery: settle immediately.
                        None => Acknowledge::new(move |_, accept| raw_ack(accept)),
                    };
                    handler(message, ack);
                });
                group.subscribe(
                    &session,
                    &ctx.destination,
                    delivery,
                    ctx.priority,
                    ctx.message_type.as_deref(),
                )
            });

        match outcome {
            Ok(subscription) => {
                if let Some(previous) = ctx.serial.replace(subscription) {
                    previous.dispose();
                }
                if attempt > 0 {
                    info!(destination = %ctx.destination, attempt, "resubscribed");
                }
                Ok(())
            }
            Err(error) if error.is_configuration() => {
                if attempt == 0 {
                    return Err(error);
                }
                error!(
                    destination = %ctx.destination,
                    %error,
                    "resubscription hit a configuration error, giving up"
                );
                Ok(())
            }
            Err(error) => {
                warn!(
                    destination = %ctx.destination,
                    attempt,
                    %error,
                    "subscription attempt failed, scheduling retry"
                );
                self.schedule_resubscription(ctx, attempt + 1);
                Ok(())
            }
        }
    }

    fn schedule_resubscription(&self, ctx: Arc<SubscriptionContext>, next_attempt: u64) {
        if self.disposing.load(Ordering::SeqCst) || ctx.serial.is_disposed() {
            return;
        }
        let delay = if next_attempt == 1 {
            Duration::from_millis(FIRST_RETRY_DELAY_MS)
        } else {
            Duration::from_millis(self.resubscription_timeout_ms.load(Ordering::SeqCst))
        };
        let manager = self.self_ref.clone();
        self.resubscription.defer(delay, move || {
            if let Some(manager) = manager.upgrade() {
                if let Err(error) = manager.do_subscribe(ctx, next_attempt) {
                    error!(%error, "resubscription failed");
                }
            }
        });
    }

    /// Wraps a transport acknowledgement into the deferred contract. A zero
    /// delay applies immediately; otherwise the decision goes through the
    /// acknowledgement delay queue, which flushes on shutdown.
    fn create_deferred_ack(&self, raw_ack: RawAck) -> Acknowledge {
        let manager = self.self_ref.clone();
        Acknowledge::new(move |delay_ms, accept| {
            if delay_ms == 0 {
                raw_ack(accept);
                return;
            }
            match manager.upgrade() {
                Some(manager) => manager
                    .deferred_acks
                    .defer(Duration::from_millis(delay_ms), move || raw_ack(accept)),
                None => raw_ack(accept),
            }
        })
    }

    pub(crate) fn send(
        &self,
        transport_id: &str,
        destination: &Destination,
        message: BinaryMessage,
        ttl_ms: Option<u64>,
        group_name: &str,
    ) -> Result<()> {
        if self.disposing.load(Ordering::SeqCst) {
            return Err(MessagingError::disposed("ProcessingGroupManager"));
        }
        let group = self.group(group_name)?;
        let session = self
            .sessions
            .session(transport_id, &group.session_name(0), None)?;
        group.send(&session, destination, message, ttl_ms)
    }

    pub fn statistics(&self) -> Vec<ProcessingGroupStats> {
        let mut stats: Vec<_> = self
            .groups
            .lock()
            .values()
            .map(|group| group.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stops resubscription, drains every group, then flushes deferred
    /// acknowledgements so none is silently dropped.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.resubscription.dispose(false);
        let groups = std::mem::take(&mut *self.groups.lock());
        for group in groups.values() {
            group.dispose();
        }
        self.deferred_acks.dispose(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        MessageCallback, RequestHandle, RequestHandler, ResponseCallback,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct MockSession {
        callbacks: Arc<Mutex<Vec<MessageCallback>>>,
    }

    impl MessagingSession for MockSession {
        fn send(&self, _: &Destination, _: BinaryMessage, _: Option<u64>) -> Result<()> {
            Ok(())
        }

        fn subscribe(
            &self,
            _: &Destination,
            callback: MessageCallback,
            _: Option<&str>,
        ) -> Result<Subscription> {
            self.callbacks.lock().push(callback);
            Ok(Subscription::noop())
        }

        fn register_handler(
            &self,
            _: &Destination,
            _: RequestHandler,
            _: Option<&str>,
        ) -> Result<Subscription> {
            Ok(Subscription::noop())
        }

        fn send_request(
            &self,
            _: &Destination,
            _: BinaryMessage,
            _: ResponseCallback,
        ) -> Result<RequestHandle> {
            Ok(RequestHandle::new(Subscription::noop()))
        }

        fn create_temporary_destination(&self) -> Destination {
            Destination::from("tmp.mock")
        }

        fn dispose(&self) {}
    }

    struct MockProvider {
        calls: AtomicUsize,
        failures_remaining: AtomicUsize,
        skip_failures_until_call: usize,
        callbacks: Arc<Mutex<Vec<MessageCallback>>>,
        hooks: Mutex<Vec<FailureHook>>,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(MockProvider {
                calls: AtomicUsize::new(0),
                failures_remaining: AtomicUsize::new(0),
                skip_failures_until_call: 0,
                callbacks: Arc::new(Mutex::new(Vec::new())),
                hooks: Mutex::new(Vec::new()),
            })
        }

        /// Fails `count` session requests, but not before `after` calls
        /// have gone through.
        fn failing(after: usize, count: usize) -> Arc<Self> {
            Arc::new(MockProvider {
                calls: AtomicUsize::new(0),
                failures_remaining: AtomicUsize::new(count),
                skip_failures_until_call: after,
                callbacks: Arc::new(Mutex::new(Vec::new())),
                hooks: Mutex::new(Vec::new()),
            })
        }

        fn deliver(&self, message: BinaryMessage, raw_ack: RawAck) {
            let callbacks = self.callbacks.lock();
            let callback = callbacks.last().expect("no subscription registered");
            callback(message, raw_ack);
        }
    }

    impl SessionProvider for MockProvider {
        fn session(
            &self,
            _: &str,
            _: &str,
            on_failure: Option<FailureHook>,
        ) -> Result<Arc<dyn MessagingSession>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.skip_failures_until_call {
                let remaining = self.failures_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                    return Err(MessagingError::Transport {
                        context: "mock session failure".to_string(),
                        source: None,
                    });
                }
            }
            if let Some(hook) = on_failure {
                self.hooks.lock().push(hook);
            }
            Ok(Arc::new(MockSession {
                callbacks: self.callbacks.clone(),
            }))
        }
    }

    fn handler_recording_acks() -> (MessageHandler, Arc<Mutex<Vec<(Instant, bool)>>>) {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let handler: MessageHandler = Arc::new(|_, ack| {
            ack.done(200, true);
        });
        (handler, settled)
    }

    fn recording_raw_ack(log: &Arc<Mutex<Vec<(Instant, bool)>>>) -> RawAck {
        let log = log.clone();
        Box::new(move |accept| {
            log.lock().push((Instant::now(), accept));
        })
    }

    #[test]
    fn duplicate_group_declaration_is_rejected() {
        let manager = ProcessingGroupManager::new(MockProvider::new()).unwrap();
        manager
            .add_processing_group("orders", ProcessingGroupInfo::default())
            .unwrap();
        let result = manager.add_processing_group("orders", ProcessingGroupInfo::default());
        assert!(matches!(
            result,
            Err(MessagingError::DuplicateProcessingGroup { .. })
        ));
        manager.dispose();
    }

    #[test]
    fn priority_on_default_group_fails_synchronously() {
        let manager = ProcessingGroupManager::new(MockProvider::new()).unwrap();
        let result = manager.subscribe(
            "main",
            "queue".into(),
            Arc::new(|_, _| {}),
            None,
            "direct",
            3,
        );
        assert!(matches!(
            result,
            Err(MessagingError::InvalidSubscription { .. })
        ));
        manager.dispose();
    }

    #[test]
    fn deferred_ack_settles_no_earlier_than_requested() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        let (handler, settled) = handler_recording_acks();
        manager
            .subscribe("main", "queue".into(), handler, None, "group", 0)
            .unwrap();

        let delivered_at = Instant::now();
        provider.deliver(BinaryMessage::default(), recording_raw_ack(&settled));

        std::thread::sleep(Duration::from_millis(500));
        let settled = settled.lock();
        assert_eq!(settled.len(), 1);
        assert!(settled[0].0.duration_since(delivered_at) >= Duration::from_millis(200));
        assert!(settled[0].1);
        manager.dispose();
    }

    #[test]
    fn dispose_flushes_pending_deferred_acks() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        let settled = Arc::new(Mutex::new(Vec::new()));
        let handler: MessageHandler = Arc::new(|_, ack| {
            ack.done(60_000, true);
        });
        manager
            .subscribe("main", "queue".into(), handler, None, "group", 0)
            .unwrap();

        provider.deliver(BinaryMessage::default(), recording_raw_ack(&settled));
        assert!(settled.lock().is_empty());

        manager.dispose();
        let settled = settled.lock();
        assert_eq!(settled.as_slice().len(), 1);
        assert!(settled[0].1);
    }

    #[test]
    fn session_failure_triggers_one_fast_resubscription() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        manager
            .subscribe(
                "main",
                "queue".into(),
                Arc::new(|_, _| {}),
                None,
                "group",
                0,
            )
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let hook = provider.hooks.lock()[0].clone();
        hook();
        hook(); // duplicate failure signals collapse

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        manager.dispose();
    }

    #[test]
    fn failed_resubscriptions_retry_at_the_configured_timeout() {
        let provider = MockProvider::failing(1, 2);
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        manager.set_resubscription_timeout(Duration::from_millis(200));
        manager
            .subscribe(
                "main",
                "queue".into(),
                Arc::new(|_, _| {}),
                None,
                "group",
                0,
            )
            .unwrap();

        provider.hooks.lock()[0].clone()();

        // attempt 1 at ~100ms fails, attempt 2 at ~300ms fails,
        // attempt 3 at ~500ms succeeds
        std::thread::sleep(Duration::from_millis(1000));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert_eq!(provider.hooks.lock().len(), 2);
        manager.dispose();
    }

    #[test]
    fn initial_transient_failures_are_retried_until_subscribed() {
        let provider = MockProvider::failing(0, 2);
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        manager.set_resubscription_timeout(Duration::from_millis(200));

        // attempt 0 fails synchronously but does not surface; attempt 1 at
        // ~100ms fails; attempt 2 at ~300ms succeeds
        manager
            .subscribe(
                "main",
                "queue".into(),
                Arc::new(|_, _| {}),
                None,
                "group",
                0,
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.hooks.lock().len(), 1);
        manager.dispose();
    }

    #[test]
    fn deliveries_after_dispose_are_rejected_unprocessed() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: MessageHandler = Arc::new(move |_, ack| {
            counter.fetch_add(1, Ordering::SeqCst);
            ack.accept();
        });
        let subscription = manager
            .subscribe("main", "queue".into(), handler, None, "group", 0)
            .unwrap();

        subscription.dispose();

        let settled = Arc::new(Mutex::new(Vec::new()));
        provider.deliver(BinaryMessage::default(), recording_raw_ack(&settled));

        assert_eq!(handled.load(Ordering::SeqCst), 0);
        let settled = settled.lock();
        assert_eq!(settled.len(), 1);
        assert!(!settled[0].1);
        manager.dispose();
    }

    #[test]
    fn deliveries_racing_manager_dispose_are_rejected_not_dropped() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: MessageHandler = Arc::new(move |_, ack| {
            counter.fetch_add(1, Ordering::SeqCst);
            ack.accept();
        });
        manager
            .subscribe("main", "queue".into(), handler, None, "group", 0)
            .unwrap();

        manager.dispose();

        // The transport still holds the callback; a message arriving after
        // dispose must be returned to it, never silently dropped.
        let settled = Arc::new(Mutex::new(Vec::new()));
        provider.deliver(BinaryMessage::default(), recording_raw_ack(&settled));

        assert_eq!(handled.load(Ordering::SeqCst), 0);
        let settled = settled.lock();
        assert_eq!(settled.len(), 1);
        assert!(!settled[0].1);
    }

    #[test]
    fn disposed_subscription_is_not_resubscribed() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        let subscription = manager
            .subscribe(
                "main",
                "queue".into(),
                Arc::new(|_, _| {}),
                None,
                "group",
                0,
            )
            .unwrap();

        subscription.dispose();
        provider.hooks.lock()[0].clone()();

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        manager.dispose();
    }

    #[test]
    fn send_goes_through_the_group_session() {
        let provider = MockProvider::new();
        let manager = ProcessingGroupManager::new(provider.clone()).unwrap();
        manager
            .send(
                "main",
                &"queue".into(),
                BinaryMessage::default(),
                None,
                "group",
            )
            .unwrap();

        let stats = manager.statistics();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "group");
        assert_eq!(stats[0].sent, 1);
        manager.dispose();
    }

    #[test]
    fn disposed_manager_rejects_new_work() {
        let manager = ProcessingGroupManager::new(MockProvider::new()).unwrap();
        manager.dispose();

        let subscribe = manager.subscribe(
            "main",
            "queue".into(),
            Arc::new(|_, _| {}),
            None,
            "group",
            0,
        );
        assert!(matches!(subscribe, Err(MessagingError::Disposed { .. })));

        let send = manager.send(
            "main",
            &"queue".into(),
            BinaryMessage::default(),
            None,
            "group",
        );
        assert!(matches!(send, Err(MessagingError::Disposed { .. })));
    }
}
