//! # Messaging Engine
//!
//! The facade applications talk to: typed send, subscribe, request/reply and
//! request handlers over resolved transports, with serialization, processing
//! groups, resubscription and deferred acknowledgements wired underneath.
//!
//! The engine is explicitly disposable. Shutdown stops accepting work, waits
//! for in-flight public calls, fails outstanding requests with a disposal
//! error (not a timeout), drains processing groups and tears the transports
//! down, in that order.

mod router;

pub use router::TypeRouter;

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::contract::{Acknowledge, BinaryMessage, Destination, Endpoint};
use crate::error::{MessagingError, Result};
use crate::processing::{
    MessageHandler, ProcessingGroupInfo, ProcessingGroupManager, ProcessingGroupStats,
    SessionProvider,
};
use crate::serialization::{message_type_tag, Message, SerializationManager};
use crate::transport::{
    DestinationUsage, TransportEvent, TransportFactory, TransportManager, TransportResolver,
};
use crate::utils::{CountingTracker, DelayQueue, SerialSubscription, Subscription};

/// Redelivery delay applied when a message cannot be decoded or its callback
/// fails: reject, but only after this long, so a poison message does not spin.
pub const DEFAULT_UNACK_DELAY_MS: u64 = 60_000;

const HANDLER_RETRY_DELAY_MS: u64 = 60_000;
const HANDLER_FIRST_RETRY_DELAY_MS: u64 = 100;

/// Per-send parameters. The defaults publish without expiry through the
/// endpoint's default processing group.
#[derive(Default)]
pub struct SendOptions {
    pub ttl_ms: Option<u64>,
    pub processing_group: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Per-subscription parameters. Priority is only meaningful for groups with a
/// concurrency level above zero.
#[derive(Default)]
pub struct SubscribeOptions {
    pub processing_group: Option<String>,
    pub priority: u32,
}

struct HandlerRegistration {
    endpoint: Endpoint,
    serial: SerialSubscription,
    message_type: Option<String>,
    raw: Arc<dyn Fn(BinaryMessage) -> BinaryMessage + Send + Sync>,
}

struct EngineInner {
    transports: Arc<TransportManager>,
    processing: Arc<ProcessingGroupManager>,
    serialization: Arc<SerializationManager>,
    disposing: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    tracker: CountingTracker,
    handles: Mutex<Vec<Subscription>>,
    request_timeouts: DelayQueue,
    handler_retries: DelayQueue,
    type_tags: DashMap<TypeId, String>,
}

pub struct MessagingEngine {
    inner: Arc<EngineInner>,
}

fn default_group_name(endpoint: &Endpoint) -> String {
    endpoint.destination.to_string()
}

fn request_session_name(endpoint: &Endpoint) -> String {
    format!("{} requests", endpoint.destination.publish)
}

fn handler_session_name(endpoint: &Endpoint) -> String {
    format!("{} handlers", endpoint.destination.subscribe)
}

impl MessagingEngine {
    pub fn new(
        resolver: Arc<dyn TransportResolver>,
        factories: Vec<Arc<dyn TransportFactory>>,
    ) -> Result<Self> {
        Self::with_serialization(resolver, factories, Arc::new(SerializationManager::default()))
    }

    pub fn with_serialization(
        resolver: Arc<dyn TransportResolver>,
        factories: Vec<Arc<dyn TransportFactory>>,
        serialization: Arc<SerializationManager>,
    ) -> Result<Self> {
        let transports = TransportManager::new(resolver, factories);
        let sessions: Arc<dyn SessionProvider> = transports.clone();
        let processing = ProcessingGroupManager::new(sessions)?;
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Ok(MessagingEngine {
            inner: Arc::new(EngineInner {
                transports,
                processing,
                serialization,
                disposing: AtomicBool::new(false),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                tracker: CountingTracker::new(),
                handles: Mutex::new(Vec::new()),
                request_timeouts: DelayQueue::new("request-timeouts")?,
                handler_retries: DelayQueue::new("handler-retries")?,
                type_tags: DashMap::new(),
            }),
        })
    }

    pub fn serialization(&self) -> Arc<SerializationManager> {
        self.inner.serialization.clone()
    }

    /// Declares a processing group before first use; see
    /// [`ProcessingGroupInfo`].
    pub fn add_processing_group(&self, name: &str, info: ProcessingGroupInfo) -> Result<()> {
        self.inner.processing.add_processing_group(name, info)
    }

    pub fn get_processing_group_info(&self, name: &str) -> Option<ProcessingGroupInfo> {
        self.inner.processing.get_processing_group_info(name)
    }

    pub fn set_resubscription_timeout(&self, timeout: Duration) {
        self.inner.processing.set_resubscription_timeout(timeout);
    }

    pub fn statistics(&self) -> Vec<ProcessingGroupStats> {
        self.inner.processing.statistics()
    }

    /// Registers a listener for transport failures. Useful for metrics and
    /// alerting; the engine handles resubscription on its own.
    pub fn subscribe_on_transport_events(
        &self,
        callback: impl Fn(&str, TransportEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .transports
            .subscribe_on_transport_events(Arc::new(callback))
    }

    /// Checks (and optionally provisions) the endpoint's destination on its
    /// transport before use.
    pub fn verify_endpoint(
        &self,
        endpoint: &Endpoint,
        usage: DestinationUsage,
        configure_if_required: bool,
    ) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.transports.verify_destination(
            &endpoint.transport_id,
            &endpoint.destination,
            usage,
            configure_if_required,
        )
    }

    /// Allocates a process-unique destination on the transport, typically to
    /// receive replies on.
    pub fn create_temporary_destination(&self, transport_id: &str) -> Result<Destination> {
        self.inner.ensure_live()?;
        let session = self.inner.transports.get_messaging_session(
            transport_id,
            "temporary destinations",
            None,
        )?;
        Ok(session.create_temporary_destination())
    }

    pub fn send<T: Message>(&self, endpoint: &Endpoint, value: &T) -> Result<()> {
        self.send_with(endpoint, value, &SendOptions::default())
    }

    pub fn send_with<T: Message>(
        &self,
        endpoint: &Endpoint,
        value: &T,
        options: &SendOptions,
    ) -> Result<()> {
        self.inner.ensure_live()?;
        let _guard = self.inner.tracker.track();

        let bytes = self
            .inner
            .serialization
            .serialize(endpoint.serialization_format, value)?;
        let mut message = BinaryMessage::new(bytes, Some(self.inner.tag::<T>()));
        message.headers.extend(
            options
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let group = options
            .processing_group
            .clone()
            .unwrap_or_else(|| default_group_name(endpoint));
        self.inner.processing.send(
            &endpoint.transport_id,
            &endpoint.destination,
            message,
            options.ttl_ms,
            &group,
        )
    }

    /// Auto-acknowledging subscription: the message is accepted once
    /// `callback` returns. Use [`subscribe_with`] to control
    /// acknowledgement yourself.
    ///
    /// [`subscribe_with`]: MessagingEngine::subscribe_with
    pub fn subscribe<T: Message>(
        &self,
        endpoint: &Endpoint,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.subscribe_with(
            endpoint,
            &SubscribeOptions::default(),
            move |value, ack: Acknowledge, _headers: &HashMap<String, String>| {
                callback(value);
                ack.accept();
                Ok(())
            },
        )
    }

    /// Typed subscription with explicit acknowledgement. The callback owns
    /// the acknowledgement decision; returning an error rejects the message
    /// with the standard redelivery delay (unless already settled).
    pub fn subscribe_with<T, F>(
        &self,
        endpoint: &Endpoint,
        options: &SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        T: Message,
        F: Fn(T, Acknowledge, &HashMap<String, String>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.inner.ensure_live()?;
        let _guard = self.inner.tracker.track();

        let format = endpoint.serialization_format;
        // Fail fast on registry misconfiguration instead of per message.
        self.inner.serialization.extract_serializer::<T>(format)?;

        let message_type = endpoint
            .shared_destination
            .then(|| self.inner.tag::<T>());
        let serialization = self.inner.serialization.clone();
        let handler: MessageHandler = Arc::new(move |binary, ack| {
            match serialization.deserialize::<T>(format, &binary.bytes) {
                Ok(value) => {
                    if let Err(cause) = callback(value, ack.clone(), &binary.headers) {
                        error!(%cause, "message callback failed, rejecting with delay");
                        ack.done(DEFAULT_UNACK_DELAY_MS, false);
                    }
                }
                Err(cause) => {
                    error!(%cause, %format, "failed to deserialize message, rejecting with delay");
                    ack.done(DEFAULT_UNACK_DELAY_MS, false);
                }
            }
        });

        let group = options
            .processing_group
            .clone()
            .unwrap_or_else(|| default_group_name(endpoint));
        let subscription = self.inner.processing.subscribe(
            &endpoint.transport_id,
            endpoint.destination.clone(),
            handler,
            message_type,
            &group,
            options.priority,
        )?;
        self.inner.track_handle(subscription.clone());
        Ok(subscription)
    }

    /// Untyped subscription over a shared destination: messages are routed to
    /// per-type callbacks by their type tag. See [`TypeRouter`].
    pub fn subscribe_routed(
        &self,
        endpoint: &Endpoint,
        options: &SubscribeOptions,
        router: TypeRouter,
    ) -> Result<Subscription> {
        self.inner.ensure_live()?;
        let _guard = self.inner.tracker.track();

        let format = endpoint.serialization_format;
        let serialization = self.inner.serialization.clone();
        let router = Arc::new(router);
        let handler: MessageHandler = Arc::new(move |binary, ack| {
            router.dispatch(&serialization, format, binary, ack);
        });

        let group = options
            .processing_group
            .clone()
            .unwrap_or_else(|| default_group_name(endpoint));
        let subscription = self.inner.processing.subscribe(
            &endpoint.transport_id,
            endpoint.destination.clone(),
            handler,
            None,
            &group,
            options.priority,
        )?;
        self.inner.track_handle(subscription.clone());
        Ok(subscription)
    }

    /// Fire-and-forget request: `on_response` is called exactly once, with
    /// the reply, a timeout error, or a disposal error if the engine shuts
    /// down first.
    pub fn send_request_async<TReq, TResp, F>(
        &self,
        endpoint: &Endpoint,
        request: &TReq,
        timeout: Duration,
        on_response: F,
    ) -> Result<()>
    where
        TReq: Message,
        TResp: Message,
        F: FnOnce(Result<TResp>) + Send + 'static,
    {
        self.inner.ensure_live()?;
        let _guard = self.inner.tracker.track();

        let format = endpoint.serialization_format;
        let bytes = self.inner.serialization.serialize(format, request)?;
        let message = BinaryMessage::new(bytes, Some(self.inner.tag::<TReq>()));

        let session = self.inner.transports.get_messaging_session(
            &endpoint.transport_id,
            &request_session_name(endpoint),
            None,
        )?;

        // One slot, two competitors: the response path and the timeout sweep.
        type ResponseSlot<T> = Arc<Mutex<Option<Box<dyn FnOnce(Result<T>) + Send>>>>;
        let slot: ResponseSlot<TResp> = Arc::new(Mutex::new(Some(Box::new(on_response))));

        let response_slot = slot.clone();
        let serialization = self.inner.serialization.clone();
        let handle = session.send_request(
            &endpoint.destination,
            message,
            Box::new(move |response| {
                if let Some(callback) = response_slot.lock().take() {
                    let result = serialization
                        .deserialize::<TResp>(format, &response.bytes)
                        .map_err(MessagingError::from);
                    callback(result);
                }
            }),
        )?;

        let timeout_ms = timeout.as_millis() as u64;
        let engine = Arc::downgrade(&self.inner);
        self.inner.request_timeouts.defer(timeout, move || {
            handle.dispose();
            if let Some(callback) = slot.lock().take() {
                let disposing = engine
                    .upgrade()
                    .map_or(true, |inner| inner.disposing.load(Ordering::SeqCst));
                let cause = if disposing {
                    MessagingError::disposed("MessagingEngine")
                } else {
                    MessagingError::RequestTimeout { timeout_ms }
                };
                callback(Err(cause));
            }
        });
        Ok(())
    }

    /// Blocking request/reply. Returns the reply, a timeout error, or a
    /// disposal error if the engine shuts down while waiting.
    pub fn send_request<TReq, TResp>(
        &self,
        endpoint: &Endpoint,
        request: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Message,
        TResp: Message,
    {
        let _guard = self.inner.tracker.track();
        let (tx, rx) = bounded(1);
        self.send_request_async(endpoint, request, timeout, move |result| {
            let _ = tx.send(result);
        })?;

        crossbeam::select! {
            recv(rx) -> result => {
                result.unwrap_or_else(|_| Err(MessagingError::disposed("MessagingEngine")))
            }
            recv(self.inner.shutdown_rx) -> _ => {
                Err(MessagingError::disposed("MessagingEngine"))
            }
        }
    }

    /// Serves typed request/reply traffic on the endpoint. The registration
    /// survives transient failures: a failed attempt is retried, and after a
    /// transport failure it is re-established, until it succeeds, hits a
    /// configuration error, or is disposed.
    pub fn register_handler<TReq, TResp, F>(
        &self,
        endpoint: &Endpoint,
        handler: F,
    ) -> Result<Subscription>
    where
        TReq: Message,
        TResp: Message,
        F: Fn(TReq) -> TResp + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        let _guard = self.inner.tracker.track();

        let format = endpoint.serialization_format;
        let serialization = self.inner.serialization.clone();
        let response_tag = self.inner.tag::<TResp>();
        let raw = Arc::new(move |request: BinaryMessage| {
            match serialization.deserialize::<TReq>(format, &request.bytes) {
                Ok(value) => {
                    let response = handler(value);
                    match serialization.serialize(format, &response) {
                        Ok(bytes) => BinaryMessage::new(bytes, Some(response_tag.clone())),
                        Err(cause) => {
                            error!(%cause, "failed to serialize handler response");
                            BinaryMessage::default()
                        }
                    }
                }
                Err(cause) => {
                    error!(%cause, "failed to deserialize request");
                    BinaryMessage::default()
                }
            }
        });

        let registration = Arc::new(HandlerRegistration {
            endpoint: endpoint.clone(),
            serial: SerialSubscription::new(),
            message_type: endpoint
                .shared_destination
                .then(|| self.inner.tag::<TReq>()),
            raw,
        });
        match self.inner.try_register_handler(&registration) {
            Ok(()) => {}
            Err(cause) if cause.is_configuration() => return Err(cause),
            Err(cause) => {
                warn!(
                    endpoint = %registration.endpoint,
                    %cause,
                    "handler registration failed, scheduling retry"
                );
                self.inner
                    .schedule_handler_registration(registration.clone(), 1);
            }
        }

        let engine = Arc::downgrade(&self.inner);
        let watched = registration.clone();
        let watcher = self.inner.transports.subscribe_on_transport_events(Arc::new(
            move |transport_id, event| {
                if event == TransportEvent::Failure
                    && transport_id == watched.endpoint.transport_id
                {
                    if let Some(inner) = engine.upgrade() {
                        inner.schedule_handler_registration(watched.clone(), 1);
                    }
                }
            },
        ));

        let serial = registration.serial.clone();
        let subscription = Subscription::new(move || {
            watcher.dispose();
            serial.dispose();
        });
        self.inner.track_handle(subscription.clone());
        Ok(subscription)
    }

    /// Ordered shutdown; see the module docs. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("messaging engine shutting down");
        drop(self.inner.shutdown_tx.lock().take());
        self.inner.tracker.wait_all();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            handle.dispose();
        }
        self.inner.handler_retries.dispose(false);
        // Flushing fails every outstanding request with a disposal error.
        self.inner.request_timeouts.dispose(true);
        self.inner.processing.dispose();
        self.inner.transports.dispose();
        info!("messaging engine disposed");
    }
}

impl Drop for MessagingEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl EngineInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposing.load(Ordering::SeqCst) {
            return Err(MessagingError::disposed("MessagingEngine"));
        }
        Ok(())
    }

    /// Records a handle for disposal at shutdown, dropping entries the caller
    /// already disposed so the registry does not grow without bound.
    fn track_handle(&self, subscription: Subscription) {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_disposed());
        handles.push(subscription);
    }

    /// Cached wire tag for `T`.
    fn tag<T: 'static>(&self) -> String {
        self.type_tags
            .entry(TypeId::of::<T>())
            .or_insert_with(message_type_tag::<T>)
            .value()
            .clone()
    }

    fn try_register_handler(self: &Arc<Self>, registration: &Arc<HandlerRegistration>) -> Result<()> {
        let session = self.transports.get_messaging_session(
            &registration.endpoint.transport_id,
            &handler_session_name(&registration.endpoint),
            None,
        )?;
        let raw = registration.raw.clone();
        let subscription = session.register_handler(
            &registration.endpoint.destination,
            Box::new(move |request| raw(request)),
            registration.message_type.as_deref(),
        )?;
        if let Some(previous) = registration.serial.replace(subscription) {
            previous.dispose();
        }
        Ok(())
    }

    fn schedule_handler_registration(
        self: &Arc<Self>,
        registration: Arc<HandlerRegistration>,
        attempt: u64,
    ) {
        if self.disposing.load(Ordering::SeqCst) || registration.serial.is_disposed() {
            return;
        }
        let delay = if attempt == 1 {
            Duration::from_millis(HANDLER_FIRST_RETRY_DELAY_MS)
        } else {
            Duration::from_millis(HANDLER_RETRY_DELAY_MS)
        };
        let engine = Arc::downgrade(self);
        self.handler_retries.defer(delay, move || {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            if inner.disposing.load(Ordering::SeqCst) || registration.serial.is_disposed() {
                return;
            }
            match inner.try_register_handler(&registration) {
                Ok(()) => {
                    info!(endpoint = %registration.endpoint, attempt, "handler re-registered");
                }
                Err(cause) if cause.is_configuration() => {
                    error!(
                        endpoint = %registration.endpoint,
                        %cause,
                        "handler re-registration hit a configuration error, giving up"
                    );
                }
                Err(cause) => {
                    warn!(
                        endpoint = %registration.endpoint,
                        attempt,
                        %cause,
                        "handler re-registration failed"
                    );
                    inner.schedule_handler_registration(registration, attempt + 1);
                }
            }
        });
    }
}
