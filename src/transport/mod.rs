//! # Transport Layer
//!
//! Abstracts the wire: transports are resolved from symbolic ids, cached per
//! broker configuration, and hand out named sessions. A failure reported by
//! any session of a transport evicts the cached instance and fans the event
//! out to every id that resolved to it, so the next subscription attempt
//! reconnects from scratch.

mod in_memory;
mod manager;
mod resolved;
mod resolver;

pub use in_memory::InMemoryTransportFactory;
pub use manager::{TransportEvent, TransportManager};
pub use resolver::StaticTransportResolver;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::contract::{BinaryMessage, Destination, RawAck, TransportInfo};
use crate::error::Result;
use crate::utils::{FailureHook, Subscription};

/// Header naming the destination a request's reply must be sent to.
pub const REPLY_TO_HEADER: &str = "reply-to";

/// Header correlating a reply with the request that caused it.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Maps symbolic transport ids to broker configurations.
pub trait TransportResolver: Send + Sync {
    fn get_transport(&self, transport_id: &str) -> Option<TransportInfo>;
}

/// Builds transports for one `messaging` kind named in [`TransportInfo`].
pub trait TransportFactory: Send + Sync {
    fn name(&self) -> &str;

    /// `on_failure` must be invoked when the transport as a whole becomes
    /// unusable; the manager evicts and broadcasts from there.
    fn create(&self, info: &TransportInfo, on_failure: FailureHook) -> Result<Arc<dyn Transport>>;
}

/// How a destination is about to be used, for verification purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationUsage {
    Publish,
    Subscribe,
}

/// One live broker connection.
pub trait Transport: Send + Sync {
    fn create_session(&self, on_failure: FailureHook) -> Result<Arc<dyn MessagingSession>>;

    /// Checks (and optionally provisions) a destination before use.
    fn verify_destination(
        &self,
        destination: &Destination,
        usage: DestinationUsage,
        configure_if_required: bool,
    ) -> Result<()>;

    fn dispose(&self);
}

/// Delivery callback: the raw message plus its settle-once decision.
pub type MessageCallback = Box<dyn Fn(BinaryMessage, RawAck) + Send + Sync>;

/// Request handler: transforms a request message into its reply.
pub type RequestHandler = Box<dyn Fn(BinaryMessage) -> BinaryMessage + Send + Sync>;

/// Invoked with the reply to an in-flight request.
pub type ResponseCallback = Box<dyn Fn(BinaryMessage) + Send + Sync>;

/// A named unit of work inside a transport. Sessions are cached per
/// (transport, name) pair; the name doubles as the processing-group binding.
pub trait MessagingSession: Send + Sync {
    fn send(
        &self,
        destination: &Destination,
        message: BinaryMessage,
        ttl_ms: Option<u64>,
    ) -> Result<()>;

    /// `message_type` narrows delivery to messages carrying that type tag;
    /// `None` subscribes to untyped traffic.
    fn subscribe(
        &self,
        destination: &Destination,
        callback: MessageCallback,
        message_type: Option<&str>,
    ) -> Result<Subscription>;

    /// Serves request/reply traffic on `destination`.
    fn register_handler(
        &self,
        destination: &Destination,
        handler: RequestHandler,
        message_type: Option<&str>,
    ) -> Result<Subscription>;

    /// Sends a request and routes the eventual reply to `on_response`.
    fn send_request(
        &self,
        destination: &Destination,
        message: BinaryMessage,
        on_response: ResponseCallback,
    ) -> Result<RequestHandle>;

    /// Allocates a process-unique destination, typically for replies.
    fn create_temporary_destination(&self) -> Destination;

    fn dispose(&self);
}

struct RequestHandleState {
    complete: AtomicBool,
    teardown: Subscription,
}

/// Tracks one outstanding request: whether a reply arrived, and the
/// subscription holding its temporary reply destination open.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Arc<RequestHandleState>,
}

impl RequestHandle {
    pub fn new(teardown: Subscription) -> Self {
        RequestHandle {
            inner: Arc::new(RequestHandleState {
                complete: AtomicBool::new(false),
                teardown,
            }),
        }
    }

    /// Marks the request answered. Returns `false` if it already was, so the
    /// caller can tell a first reply from a duplicate.
    pub fn mark_complete(&self) -> bool {
        !self.inner.complete.swap(true, Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::SeqCst)
    }

    /// Releases the reply destination. Does not mark the request complete.
    pub fn dispose(&self) {
        self.inner.teardown.dispose();
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}
