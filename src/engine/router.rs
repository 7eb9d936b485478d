//! Routes messages from a shared destination to per-type callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::contract::{Acknowledge, BinaryMessage};
use crate::serialization::{
    message_type_tag, Message, SerializationFormat, SerializationManager,
};

use super::DEFAULT_UNACK_DELAY_MS;

type Route =
    Box<dyn Fn(&SerializationManager, SerializationFormat, BinaryMessage, Acknowledge) + Send + Sync>;
type UnknownTypeCallback = Box<dyn Fn(BinaryMessage, Acknowledge) + Send + Sync>;

/// Dispatch table for a multi-type subscription: one callback per expected
/// type tag, plus an optional catch-all for unknown tags. Built by the caller
/// and passed to [`MessagingEngine::subscribe_routed`].
///
/// [`MessagingEngine::subscribe_routed`]: super::MessagingEngine::subscribe_routed
#[derive(Default)]
pub struct TypeRouter {
    routes: HashMap<String, Route>,
    unknown: Option<UnknownTypeCallback>,
}

impl TypeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages tagged with `T`'s type tag to `callback`. The callback
    /// owns acknowledgement; a message that fails to decode is rejected with
    /// the standard redelivery delay.
    pub fn route<T, F>(mut self, callback: F) -> Self
    where
        T: Message,
        F: Fn(T, Acknowledge) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.routes.insert(
            message_type_tag::<T>(),
            Box::new(move |serialization, format, message, ack| {
                match serialization.deserialize::<T>(format, &message.bytes) {
                    Ok(value) => callback(value, ack),
                    Err(error) => {
                        warn!(%error, "failed to decode routed message, rejecting");
                        ack.done(DEFAULT_UNACK_DELAY_MS, false);
                    }
                }
            }),
        );
        self
    }

    /// Callback for messages whose tag matches no registered route. Without
    /// one, such messages are rejected with the standard redelivery delay.
    pub fn on_unknown_type<F>(mut self, callback: F) -> Self
    where
        F: Fn(BinaryMessage, Acknowledge) + Send + Sync + 'static,
    {
        self.unknown = Some(Box::new(callback));
        self
    }

    pub(crate) fn dispatch(
        &self,
        serialization: &SerializationManager,
        format: SerializationFormat,
        message: BinaryMessage,
        ack: Acknowledge,
    ) {
        let tag = message.type_tag.clone().unwrap_or_default();
        match self.routes.get(&tag) {
            Some(route) => route(serialization, format, message, ack),
            None => match &self.unknown {
                Some(unknown) => unknown(message, ack),
                None => {
                    warn!(type_tag = %tag, "no route for message type, rejecting");
                    ack.done(DEFAULT_UNACK_DELAY_MS, false);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pong {
        n: u32,
    }

    fn tagged(serialization: &SerializationManager, tag: &str, n: u32) -> BinaryMessage {
        let bytes = serialization
            .serialize(SerializationFormat::Json, &Ping { n })
            .unwrap();
        BinaryMessage::new(bytes, Some(tag.to_string()))
    }

    #[test]
    fn dispatches_by_type_tag() {
        let serialization = SerializationManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pings = seen.clone();
        let pongs = seen.clone();
        let router = TypeRouter::new()
            .route::<Ping, _>(move |ping, ack| {
                pings.lock().push(("ping", ping.n));
                ack.accept();
            })
            .route::<Pong, _>(move |pong, ack| {
                pongs.lock().push(("pong", pong.n));
                ack.accept();
            });

        router.dispatch(
            &serialization,
            SerializationFormat::Json,
            tagged(&serialization, "Ping", 1),
            Acknowledge::new(|_, _| {}),
        );
        router.dispatch(
            &serialization,
            SerializationFormat::Json,
            tagged(&serialization, "Pong", 2),
            Acknowledge::new(|_, _| {}),
        );

        assert_eq!(seen.lock().as_slice(), &[("ping", 1), ("pong", 2)]);
    }

    #[test]
    fn unknown_tag_without_catch_all_is_rejected_with_delay() {
        let serialization = SerializationManager::default();
        let router = TypeRouter::new().route::<Ping, _>(|_, ack| ack.accept());

        let decision = Arc::new(Mutex::new(None));
        let slot = decision.clone();
        router.dispatch(
            &serialization,
            SerializationFormat::Json,
            tagged(&serialization, "Mystery", 3),
            Acknowledge::new(move |delay, accept| {
                *slot.lock() = Some((delay, accept));
            }),
        );

        assert_eq!(*decision.lock(), Some((DEFAULT_UNACK_DELAY_MS, false)));
    }

    #[test]
    fn unknown_tag_reaches_the_catch_all() {
        let serialization = SerializationManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let unknown = seen.clone();
        let router = TypeRouter::new()
            .route::<Ping, _>(|_, ack| ack.accept())
            .on_unknown_type(move |message, ack| {
                unknown.lock().push(message.type_tag);
                ack.accept();
            });

        router.dispatch(
            &serialization,
            SerializationFormat::Json,
            tagged(&serialization, "Mystery", 3),
            Acknowledge::new(|_, _| {}),
        );

        assert_eq!(
            seen.lock().as_slice(),
            &[Some("Mystery".to_string())]
        );
    }
}
