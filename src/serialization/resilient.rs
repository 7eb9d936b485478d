//! Binary serializer that tolerates format drift between peers.
//!
//! Serialization always uses the configured native format. Deserialization
//! walks a priority-ordered list of binary formats until one decodes the
//! payload; the winner is promoted to the front of the list, so a stream of
//! uniformly-encoded traffic settles on a single attempt per message after
//! the first.

use std::marker::PhantomData;

use parking_lot::Mutex;
use tracing::warn;

use super::formats;
use super::{Message, MessageSerializer, SerializationError, SerializationFormat};

/// All binary formats, in default probe order.
const BINARY_FORMATS: [SerializationFormat; 2] =
    [SerializationFormat::Cbor, SerializationFormat::Bincode];

pub struct ResilientBinarySerializer<T> {
    native: SerializationFormat,
    priority: Mutex<Vec<SerializationFormat>>,
    _message: PhantomData<fn() -> T>,
}

impl<T> ResilientBinarySerializer<T> {
    /// `native` must be a binary format; it is moved to the front of the
    /// probe list so uniform traffic decodes on the first attempt.
    pub fn new(native: SerializationFormat) -> Result<Self, SerializationError> {
        if !native.is_binary() {
            return Err(SerializationError::UnsupportedNativeFormat { format: native });
        }
        let mut priority: Vec<_> = BINARY_FORMATS.to_vec();
        if let Some(pos) = priority.iter().position(|f| *f == native) {
            priority.remove(pos);
        }
        priority.insert(0, native);
        Ok(ResilientBinarySerializer {
            native,
            priority: Mutex::new(priority),
            _message: PhantomData,
        })
    }

    fn promote(&self, format: SerializationFormat) {
        let mut priority = self.priority.lock();
        if let Some(pos) = priority.iter().position(|f| *f == format) {
            if pos > 0 {
                priority.remove(pos);
                priority.insert(0, format);
            }
        }
    }
}

impl<T: Message> MessageSerializer<T> for ResilientBinarySerializer<T> {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        formats::encode(self.native, value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        let attempts = self.priority.lock().clone();
        let mut failures = Vec::with_capacity(attempts.len());
        for format in attempts {
            match formats::decode::<T>(format, bytes) {
                Ok(value) => {
                    if format != self.native {
                        warn!(
                            expected = %self.native,
                            actual = %format,
                            "payload decoded with non-native binary format"
                        );
                    }
                    self.promote(format);
                    return Ok(value);
                }
                Err(error) => failures.push(format!("{format}: {error}")),
            }
        }
        Err(SerializationError::BinaryDeserialization {
            message: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Tick {
        seq: u64,
        price: String,
    }

    fn sample() -> Tick {
        Tick {
            seq: 7,
            price: "100.25".into(),
        }
    }

    #[test]
    fn rejects_textual_native_format() {
        let result = ResilientBinarySerializer::<Tick>::new(SerializationFormat::Json);
        assert!(matches!(
            result,
            Err(SerializationError::UnsupportedNativeFormat { .. })
        ));
    }

    #[test]
    fn serializes_in_native_format_only() {
        let serializer =
            ResilientBinarySerializer::<Tick>::new(SerializationFormat::Bincode).unwrap();
        let bytes = serializer.serialize(&sample()).unwrap();
        let direct: Tick = formats::decode(SerializationFormat::Bincode, &bytes).unwrap();
        assert_eq!(direct, sample());
    }

    #[test]
    fn falls_back_to_foreign_format_and_promotes_it() {
        let serializer =
            ResilientBinarySerializer::<Tick>::new(SerializationFormat::Bincode).unwrap();
        let cbor_bytes = formats::encode(SerializationFormat::Cbor, &sample()).unwrap();

        assert_eq!(serializer.deserialize(&cbor_bytes).unwrap(), sample());
        assert_eq!(
            serializer.priority.lock().first().copied(),
            Some(SerializationFormat::Cbor)
        );

        // Native traffic still decodes after the reorder.
        let native_bytes = serializer.serialize(&sample()).unwrap();
        assert_eq!(serializer.deserialize(&native_bytes).unwrap(), sample());
    }

    #[test]
    fn reports_all_attempts_when_nothing_decodes() {
        let serializer =
            ResilientBinarySerializer::<Tick>::new(SerializationFormat::Cbor).unwrap();
        let result = serializer.deserialize(b"\xff\xff\xff\xff\xff\xff\xff\xff\xff");
        match result {
            Err(SerializationError::BinaryDeserialization { message }) => {
                assert!(message.contains("Cbor"));
                assert!(message.contains("Bincode"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
