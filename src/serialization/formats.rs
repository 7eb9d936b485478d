//! Concrete codecs for the supported wire formats, plus the default
//! serializer factories the manager is seeded with.
//!
//! Bincode runs in strict mode (varint integers, trailing bytes rejected) so
//! that a payload produced by another binary format does not decode by
//! accident during resilient fallback.

use std::marker::PhantomData;

use bincode::Options;

use super::{
    BoxedSerializer, Message, MessageSerializer, MessageTypeHandle, SerializationError,
    SerializationFormat, SerializerFactory,
};

fn bincode_codec() -> impl bincode::Options {
    bincode::options()
}

/// Encodes `value` in the given binary or textual format.
pub(crate) fn encode<T: serde::Serialize>(
    format: SerializationFormat,
    value: &T,
) -> Result<Vec<u8>, SerializationError> {
    match format {
        SerializationFormat::Json => serde_json::to_vec(value).map_err(|e| {
            SerializationError::Encode {
                format,
                message: e.to_string(),
            }
        }),
        SerializationFormat::Bincode => bincode_codec().serialize(value).map_err(|e| {
            SerializationError::Encode {
                format,
                message: e.to_string(),
            }
        }),
        SerializationFormat::Cbor => {
            let mut bytes = Vec::new();
            ciborium::into_writer(value, &mut bytes).map_err(|e| SerializationError::Encode {
                format,
                message: e.to_string(),
            })?;
            Ok(bytes)
        }
    }
}

/// Decodes `bytes` assuming the given format.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    format: SerializationFormat,
    bytes: &[u8],
) -> Result<T, SerializationError> {
    match format {
        SerializationFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
                format,
                message: e.to_string(),
            })
        }
        SerializationFormat::Bincode => bincode_codec().deserialize(bytes).map_err(|e| {
            SerializationError::Decode {
                format,
                message: e.to_string(),
            }
        }),
        SerializationFormat::Cbor => {
            ciborium::from_reader(bytes).map_err(|e| SerializationError::Decode {
                format,
                message: e.to_string(),
            })
        }
    }
}

/// Plain JSON serializer for one message type.
pub struct JsonSerializer<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        JsonSerializer {
            _message: PhantomData,
        }
    }
}

impl<T: Message> MessageSerializer<T> for JsonSerializer<T> {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        encode(SerializationFormat::Json, value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        decode(SerializationFormat::Json, bytes)
    }
}

/// Default JSON factory: accepts every message type.
pub struct JsonSerializerFactory;

impl SerializerFactory for JsonSerializerFactory {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn create(&self, message_type: &MessageTypeHandle) -> Option<BoxedSerializer> {
        Some(message_type.json())
    }
}

/// Default CBOR factory: builds a resilient binary serializer with CBOR as
/// the native format, so mixed-format binary traffic still deserializes.
pub struct CborSerializerFactory;

impl SerializerFactory for CborSerializerFactory {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Cbor
    }

    fn create(&self, message_type: &MessageTypeHandle) -> Option<BoxedSerializer> {
        message_type.resilient(SerializationFormat::Cbor).ok()
    }
}

/// Default Bincode factory, the binary counterpart of [`CborSerializerFactory`].
pub struct BincodeSerializerFactory;

impl SerializerFactory for BincodeSerializerFactory {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Bincode
    }

    fn create(&self, message_type: &MessageTypeHandle) -> Option<BoxedSerializer> {
        message_type.resilient(SerializationFormat::Bincode).ok()
    }
}
