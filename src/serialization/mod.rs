//! # Serialization Layer
//!
//! A per-(format, type) serializer registry with on-demand, single-creation
//! construction from registered factories, plus the resilient binary
//! serializer that falls back across binary formats on deserialization and
//! adaptively reorders them toward whatever the incoming data actually is.
//!
//! The registry is keyed by `TypeId`. Factories cannot carry generic methods
//! across a trait object boundary, so they receive a [`MessageTypeHandle`]: a
//! constructor menu monomorphized for the probed message type. A factory
//! builds a serializer from the menu or declines the type by returning `None`.

mod formats;
mod manager;
mod resilient;

pub use formats::{
    BincodeSerializerFactory, CborSerializerFactory, JsonSerializer, JsonSerializerFactory,
};
pub use manager::SerializationManager;
pub use resilient::ResilientBinarySerializer;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Wire formats the engine can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializationFormat {
    Json,
    Bincode,
    Cbor,
}

impl SerializationFormat {
    /// Binary formats participate in resilient fallback deserialization.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            SerializationFormat::Bincode | SerializationFormat::Cbor
        )
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SerializationFormat::Json => "Json",
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Cbor => "Cbor",
        };
        f.write_str(name)
    }
}

/// Errors raised by the serializer registry and the codecs.
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("{format} serializer for type {type_name} not found")]
    NoSerializer {
        format: SerializationFormat,
        type_name: &'static str,
    },

    #[error("more than one {format} serializer is available for type {type_name}")]
    AmbiguousSerializer {
        format: SerializationFormat,
        type_name: &'static str,
    },

    #[error("a {format} serializer for type {type_name} is already registered")]
    AlreadyRegistered {
        format: SerializationFormat,
        type_name: &'static str,
    },

    #[error("serialization format {format} is not supported as a native binary format")]
    UnsupportedNativeFormat { format: SerializationFormat },

    #[error("failed to encode as {format}: {message}")]
    Encode {
        format: SerializationFormat,
        message: String,
    },

    #[error("failed to decode as {format}: {message}")]
    Decode {
        format: SerializationFormat,
        message: String,
    },

    /// Terminal: the payload matched no known binary format wrapper.
    #[error("payload matches no supported binary format: {message}")]
    BinaryDeserialization { message: String },
}

impl SerializationError {
    /// Registry misconfiguration rather than bad data; retrying cannot help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SerializationError::NoSerializer { .. }
                | SerializationError::AmbiguousSerializer { .. }
                | SerializationError::AlreadyRegistered { .. }
                | SerializationError::UnsupportedNativeFormat { .. }
        )
    }
}

/// Bound required of every message payload the engine moves.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Message for T {}

/// Encodes/decodes one message type in one format.
pub trait MessageSerializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// Type-erased `Arc<dyn MessageSerializer<T>>`, storable in the registry map.
pub struct BoxedSerializer {
    type_id: TypeId,
    inner: Box<dyn Any + Send + Sync>,
}

impl BoxedSerializer {
    pub fn new<T: Message>(serializer: Arc<dyn MessageSerializer<T>>) -> Self {
        BoxedSerializer {
            type_id: TypeId::of::<T>(),
            inner: Box::new(serializer),
        }
    }

    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn downcast<T: Message>(&self) -> Option<Arc<dyn MessageSerializer<T>>> {
        self.inner
            .downcast_ref::<Arc<dyn MessageSerializer<T>>>()
            .cloned()
    }
}

/// Constructor menu for one message type, monomorphized at the registry's
/// lookup site. Factories build from the menu instead of naming the type.
pub struct MessageTypeHandle {
    type_id: TypeId,
    type_name: &'static str,
    build_json: fn() -> BoxedSerializer,
    build_resilient: fn(SerializationFormat) -> Result<BoxedSerializer, SerializationError>,
}

impl MessageTypeHandle {
    pub fn of<T: Message>() -> Self {
        MessageTypeHandle {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            build_json: || BoxedSerializer::new::<T>(Arc::new(formats::JsonSerializer::default())),
            build_resilient: |native| {
                Ok(BoxedSerializer::new::<T>(Arc::new(
                    ResilientBinarySerializer::new(native)?,
                )))
            },
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully-qualified Rust type name of the probed message type, usable by
    /// factories as a decline criterion.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Builds a JSON serializer for the probed type.
    pub fn json(&self) -> BoxedSerializer {
        (self.build_json)()
    }

    /// Builds a resilient binary serializer with the given native format.
    pub fn resilient(
        &self,
        native: SerializationFormat,
    ) -> Result<BoxedSerializer, SerializationError> {
        (self.build_resilient)(native)
    }
}

/// Creates serializers for a declared format, declining types it cannot
/// handle. Registered with [`SerializationManager::register_serializer_factory`].
pub trait SerializerFactory: Send + Sync {
    fn format(&self) -> SerializationFormat;
    fn create(&self, message_type: &MessageTypeHandle) -> Option<BoxedSerializer>;
}

/// Derives the wire type tag for a message type: the unqualified type name,
/// with generic arguments stripped. Cached per engine at first use.
pub fn message_type_tag<T: 'static>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_is_unqualified_name() {
        assert_eq!(message_type_tag::<String>(), "String");
        assert_eq!(message_type_tag::<Vec<u8>>(), "Vec");
    }

    #[test]
    fn boxed_serializer_downcasts_to_original_type() {
        let boxed = BoxedSerializer::new::<String>(Arc::new(JsonSerializer::default()));
        assert!(boxed.downcast::<String>().is_some());
        assert!(boxed.downcast::<u64>().is_none());
    }
}
