use std::fmt;

use crate::contract::Destination;
use crate::serialization::SerializationFormat;

/// Identifies where and how to send or receive: a destination plus transport
/// and serialization binding. Immutable value; created by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport_id: String,
    pub destination: Destination,
    /// When set, the destination is shared between message types and
    /// subscriptions are routed by type tag.
    pub shared_destination: bool,
    pub serialization_format: SerializationFormat,
}

impl Endpoint {
    pub fn new(transport_id: impl Into<String>, destination: impl Into<Destination>) -> Self {
        Endpoint {
            transport_id: transport_id.into(),
            destination: destination.into(),
            shared_destination: false,
            serialization_format: SerializationFormat::Json,
        }
    }

    pub fn with_serialization_format(mut self, format: SerializationFormat) -> Self {
        self.serialization_format = format;
        self
    }

    pub fn with_shared_destination(mut self, shared: bool) -> Self {
        self.shared_destination = shared;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Transport: {}, Destination: {}]",
            self.transport_id, self.destination
        )
    }
}
