//! The serializer registry: explicit registrations plus lazy factory-built
//! serializers, created at most once per (format, type) pair.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    BincodeSerializerFactory, BoxedSerializer, CborSerializerFactory, JsonSerializerFactory,
    Message, MessageSerializer, MessageTypeHandle, SerializationError, SerializationFormat,
    SerializerFactory,
};

type RegistryKey = (SerializationFormat, TypeId);

pub struct SerializationManager {
    factories: Mutex<Vec<Arc<dyn SerializerFactory>>>,
    serializers: RwLock<HashMap<RegistryKey, BoxedSerializer>>,
}

impl Default for SerializationManager {
    /// Seeded with the default factories: JSON for every type, and resilient
    /// binary serializers for CBOR and Bincode.
    fn default() -> Self {
        let manager = SerializationManager::empty();
        {
            let mut factories = manager.factories.lock();
            factories.push(Arc::new(JsonSerializerFactory));
            factories.push(Arc::new(CborSerializerFactory));
            factories.push(Arc::new(BincodeSerializerFactory));
        }
        manager
    }
}

impl SerializationManager {
    /// A manager with no factories at all; every lookup fails until
    /// serializers or factories are registered.
    pub fn empty() -> Self {
        SerializationManager {
            factories: Mutex::new(Vec::new()),
            serializers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an explicit serializer for `T` in `format`. Fails if the
    /// (format, type) pair already has one.
    pub fn register_serializer<T: Message>(
        &self,
        format: SerializationFormat,
        serializer: Arc<dyn MessageSerializer<T>>,
    ) -> Result<(), SerializationError> {
        let key = (format, TypeId::of::<T>());
        let mut serializers = self.serializers.write();
        if serializers.contains_key(&key) {
            return Err(SerializationError::AlreadyRegistered {
                format,
                type_name: std::any::type_name::<T>(),
            });
        }
        serializers.insert(key, BoxedSerializer::new::<T>(serializer));
        Ok(())
    }

    /// Registers a factory consulted for (format, type) pairs that have no
    /// explicit serializer yet. Existing cached serializers are unaffected.
    pub fn register_serializer_factory(&self, factory: Arc<dyn SerializerFactory>) {
        self.factories.lock().push(factory);
    }

    pub fn serialize<T: Message>(
        &self,
        format: SerializationFormat,
        value: &T,
    ) -> Result<Vec<u8>, SerializationError> {
        self.extract_serializer::<T>(format)?.serialize(value)
    }

    pub fn deserialize<T: Message>(
        &self,
        format: SerializationFormat,
        bytes: &[u8],
    ) -> Result<T, SerializationError> {
        self.extract_serializer::<T>(format)?.deserialize(bytes)
    }

    /// Returns the serializer for (format, T), building it through the
    /// factories on first use. Exactly one factory must accept the type;
    /// zero or several is a configuration error.
    pub fn extract_serializer<T: Message>(
        &self,
        format: SerializationFormat,
    ) -> Result<Arc<dyn MessageSerializer<T>>, SerializationError> {
        let key = (format, TypeId::of::<T>());
        if let Some(existing) = self.serializers.read().get(&key) {
            if let Some(serializer) = existing.downcast::<T>() {
                return Ok(serializer);
            }
        }

        let handle = MessageTypeHandle::of::<T>();
        let factories: Vec<_> = self
            .factories
            .lock()
            .iter()
            .filter(|f| f.format() == format)
            .cloned()
            .collect();
        let mut candidates: Vec<BoxedSerializer> =
            factories.iter().filter_map(|f| f.create(&handle)).collect();

        match candidates.len() {
            0 => Err(SerializationError::NoSerializer {
                format,
                type_name: std::any::type_name::<T>(),
            }),
            1 => {
                let built = candidates.remove(0);
                let mut serializers = self.serializers.write();
                // Another thread may have built one while we were probing
                // factories; the first insert wins.
                let stored = serializers.entry(key).or_insert_with(|| {
                    debug!(
                        %format,
                        message_type = handle.type_name(),
                        "created serializer from factory"
                    );
                    built
                });
                stored
                    .downcast::<T>()
                    .ok_or(SerializationError::NoSerializer {
                        format,
                        type_name: std::any::type_name::<T>(),
                    })
            }
            _ => Err(SerializationError::AmbiguousSerializer {
                format,
                type_name: std::any::type_name::<T>(),
            }),
        }
    }
}
