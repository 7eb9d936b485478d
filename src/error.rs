//! # Messaging Error Types
//!
//! Structured error handling for the engine using thiserror. The taxonomy
//! separates configuration errors (non-retryable, surfaced synchronously)
//! from transient infrastructure errors (retried with backoff) and
//! message-level errors (isolated per message).

use thiserror::Error;

use crate::serialization::{SerializationError, SerializationFormat};

/// Errors surfaced by the messaging engine and its subsystems.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// The transport resolver knows nothing about this transport id.
    #[error("transport '{transport_id}' is not resolvable")]
    UnresolvableTransport { transport_id: String },

    /// The resolved configuration names a messaging kind no registered factory supports.
    #[error("can not create transport '{transport_id}': '{kind}' messaging is not supported")]
    UnsupportedMessaging { transport_id: String, kind: String },

    /// Subscription parameters are incompatible with the processing group configuration.
    #[error("invalid subscription: {message}")]
    InvalidSubscription { message: String },

    /// A transport-level operation failed. Wraps the underlying cause for diagnostics.
    #[error("transport failure: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<Box<MessagingError>>,
    },

    /// A destination existence or configuration check failed.
    #[error("destination {destination} is not properly configured: {reason}")]
    DestinationVerification { destination: String, reason: String },

    /// Serializer registry or codec failure.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Delivered message could not be decoded in the endpoint's format.
    #[error("failed to deserialize message as {format}: {message}")]
    MessageDeserialization {
        format: SerializationFormat,
        message: String,
    },

    /// A request received no response within its timeout.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    /// New work was submitted after shutdown began. Distinct from a timeout.
    #[error("{component} is disposed")]
    Disposed { component: String },

    /// A processing group was registered twice.
    #[error("can not add processing group '{name}': it already exists")]
    DuplicateProcessingGroup { name: String },

    /// Handler and callback failures that carry application context.
    #[error("processing failed: {message}")]
    Processing { message: String },
}

impl MessagingError {
    pub(crate) fn disposed(component: &str) -> Self {
        MessagingError::Disposed {
            component: component.to_string(),
        }
    }

    /// Configuration errors are permanent: retrying the same call can never succeed.
    /// Resubscription and handler re-registration loops stop on these.
    pub fn is_configuration(&self) -> bool {
        match self {
            MessagingError::UnresolvableTransport { .. }
            | MessagingError::UnsupportedMessaging { .. }
            | MessagingError::InvalidSubscription { .. }
            | MessagingError::DuplicateProcessingGroup { .. } => true,
            MessagingError::Serialization(e) => e.is_configuration(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MessagingError>;
