//! In-process transport, mainly for tests and local wiring. Destinations are
//! created on demand; messages sent before anyone subscribes are buffered and
//! drained to the first matching subscriber. Each subscriber gets a dedicated
//! delivery thread, so callbacks never run on the sender's thread.
//!
//! Delivery is at-most-once to a single subscriber: an exact type-tag match
//! wins over an untyped subscriber. Acknowledgements are accepted and
//! discarded, there is no redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::contract::{BinaryMessage, Destination, TransportInfo};
use crate::error::{MessagingError, Result};
use crate::utils::{FailureHook, Subscription};

use super::{
    DestinationUsage, MessageCallback, MessagingSession, RequestHandle, RequestHandler,
    ResponseCallback, Transport, TransportFactory, CORRELATION_ID_HEADER, REPLY_TO_HEADER,
};

pub struct InMemoryTransportFactory;

impl TransportFactory for InMemoryTransportFactory {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn create(&self, _info: &TransportInfo, _on_failure: FailureHook) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(InMemoryTransport {
            core: Arc::new(Core::default()),
        }))
    }
}

struct SubscriberEntry {
    id: u64,
    message_type: Option<String>,
    sender: Sender<BinaryMessage>,
}

#[derive(Default)]
struct Topic {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    backlog: Mutex<VecDeque<BinaryMessage>>,
}

#[derive(Default)]
struct Core {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    next_subscriber_id: AtomicU64,
    disposed: AtomicBool,
}

fn tag_matches(subscriber_type: &Option<String>, message_tag: &Option<String>) -> bool {
    match subscriber_type {
        Some(wanted) => message_tag.as_deref() == Some(wanted.as_str()),
        None => true,
    }
}

impl Core {
    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock();
        topics.entry(name.to_string()).or_default().clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::disposed("InMemoryTransport"));
        }
        Ok(())
    }

    fn send(&self, destination: &Destination, message: BinaryMessage) -> Result<()> {
        self.ensure_live()?;
        let topic = self.topic(&destination.publish);
        let subscribers = topic.subscribers.lock();

        // Exact tag match beats the untyped catch-all.
        let target = subscribers
            .iter()
            .find(|s| s.message_type.is_some() && tag_matches(&s.message_type, &message.type_tag))
            .or_else(|| subscribers.iter().find(|s| s.message_type.is_none()));

        match target {
            Some(subscriber) => subscriber.sender.send(message).map_err(|_| {
                MessagingError::Transport {
                    context: format!("in-memory delivery to {destination} failed"),
                    source: None,
                }
            }),
            None => {
                topic.backlog.lock().push_back(message);
                Ok(())
            }
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        destination: &Destination,
        callback: MessageCallback,
        message_type: Option<&str>,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        let topic = self.topic(&destination.subscribe);
        let (sender, receiver) = unbounded::<BinaryMessage>();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let wanted = message_type.map(str::to_string);

        std::thread::Builder::new()
            .name(format!("courier-inmem-{}", destination.subscribe))
            .spawn(move || {
                for message in receiver {
                    callback(message, Box::new(|_| {}));
                }
            })
            .map_err(|e| MessagingError::Transport {
                context: format!("failed to spawn in-memory delivery thread: {e}"),
                source: None,
            })?;

        {
            let mut subscribers = topic.subscribers.lock();
            subscribers.push(SubscriberEntry {
                id,
                message_type: wanted.clone(),
                sender: sender.clone(),
            });

            // Replay buffered traffic this subscriber is eligible for.
            let mut backlog = topic.backlog.lock();
            let mut remaining = VecDeque::with_capacity(backlog.len());
            for message in backlog.drain(..) {
                if tag_matches(&wanted, &message.type_tag) {
                    if sender.send(message).is_err() {
                        break;
                    }
                } else {
                    remaining.push_back(message);
                }
            }
            *backlog = remaining;
        }

        let teardown_topic = topic.clone();
        Ok(Subscription::new(move || {
            teardown_topic.subscribers.lock().retain(|s| s.id != id);
        }))
    }

    fn register_handler(
        self: &Arc<Self>,
        destination: &Destination,
        handler: RequestHandler,
        message_type: Option<&str>,
    ) -> Result<Subscription> {
        let core = self.clone();
        self.subscribe(
            destination,
            Box::new(move |message, ack| {
                let reply_to = message.headers.get(REPLY_TO_HEADER).cloned();
                let correlation = message.headers.get(CORRELATION_ID_HEADER).cloned();
                let mut response = handler(message);
                ack(true);
                let Some(reply_to) = reply_to else {
                    warn!("request without reply address, dropping response");
                    return;
                };
                if let Some(correlation) = correlation {
                    response
                        .headers
                        .insert(CORRELATION_ID_HEADER.to_string(), correlation);
                }
                if let Err(error) = core.send(&Destination::from(reply_to), response) {
                    warn!(%error, "failed to deliver in-memory reply");
                }
            }),
            message_type,
        )
    }

    fn temporary_destination() -> Destination {
        Destination::from(format!("tmp.{}", Uuid::new_v4()))
    }

    fn send_request(
        self: &Arc<Self>,
        destination: &Destination,
        mut message: BinaryMessage,
        on_response: ResponseCallback,
    ) -> Result<RequestHandle> {
        self.ensure_live()?;
        let reply_to = Self::temporary_destination().subscribe;
        let correlation = Uuid::new_v4().to_string();

        let subscription = self.subscribe(
            &Destination::from(reply_to.as_str()),
            Box::new(move |response, ack| {
                ack(true);
                on_response(response);
            }),
            None,
        )?;

        message
            .headers
            .insert(REPLY_TO_HEADER.to_string(), reply_to);
        message
            .headers
            .insert(CORRELATION_ID_HEADER.to_string(), correlation);
        if let Err(error) = self.send(destination, message) {
            subscription.dispose();
            return Err(error);
        }
        Ok(RequestHandle::new(subscription))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the topics drops every sender; delivery threads drain and
        // exit on disconnect.
        self.topics.lock().clear();
    }
}

pub(crate) struct InMemoryTransport {
    core: Arc<Core>,
}

impl Transport for InMemoryTransport {
    fn create_session(&self, _on_failure: FailureHook) -> Result<Arc<dyn MessagingSession>> {
        self.core.ensure_live()?;
        Ok(Arc::new(InMemorySession {
            core: self.core.clone(),
        }))
    }

    fn verify_destination(
        &self,
        destination: &Destination,
        _usage: DestinationUsage,
        configure_if_required: bool,
    ) -> Result<()> {
        if configure_if_required {
            self.core.topic(&destination.subscribe);
            self.core.topic(&destination.publish);
        }
        Ok(())
    }

    fn dispose(&self) {
        self.core.dispose();
    }
}

struct InMemorySession {
    core: Arc<Core>,
}

impl MessagingSession for InMemorySession {
    fn send(
        &self,
        destination: &Destination,
        message: BinaryMessage,
        _ttl_ms: Option<u64>,
    ) -> Result<()> {
        self.core.send(destination, message)
    }

    fn subscribe(
        &self,
        destination: &Destination,
        callback: MessageCallback,
        message_type: Option<&str>,
    ) -> Result<Subscription> {
        self.core.subscribe(destination, callback, message_type)
    }

    fn register_handler(
        &self,
        destination: &Destination,
        handler: RequestHandler,
        message_type: Option<&str>,
    ) -> Result<Subscription> {
        self.core.register_handler(destination, handler, message_type)
    }

    fn send_request(
        &self,
        destination: &Destination,
        message: BinaryMessage,
        on_response: ResponseCallback,
    ) -> Result<RequestHandle> {
        self.core.send_request(destination, message, on_response)
    }

    fn create_temporary_destination(&self) -> Destination {
        Core::temporary_destination()
    }

    fn dispose(&self) {}
}
