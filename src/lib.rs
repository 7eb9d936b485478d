//! # courier-core
//!
//! Transport-agnostic messaging engine: typed publish/subscribe and
//! request/reply over pluggable transports, with per-group concurrency
//! isolation, priority lanes, deferred acknowledgements and automatic
//! resubscription after transport failures.
//!
//! ## Architecture
//!
//! - [`engine`] — the [`MessagingEngine`] facade applications use
//! - [`transport`] — transport resolution, session caching, failure fan-out,
//!   and the built-in in-memory transport
//! - [`processing`] — processing groups: bounded worker pools with priority
//!   lanes, resubscription and deferred acknowledgements
//! - [`serialization`] — the per-(format, type) serializer registry and the
//!   resilient binary serializer
//! - [`contract`] — the value types shared across layers
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use courier_core::{Endpoint, MessagingEngine, StaticTransportResolver, TransportInfo};
//!
//! let resolver = StaticTransportResolver::new().with_transport(
//!     "main",
//!     TransportInfo::new("localhost", "guest", "guest", "dev", "in-memory"),
//! );
//! let engine = MessagingEngine::new(Arc::new(resolver), Vec::new()).unwrap();
//!
//! let endpoint = Endpoint::new("main", "greetings");
//! let subscription = engine
//!     .subscribe(&endpoint, |text: String| println!("{text}"))
//!     .unwrap();
//! engine.send(&endpoint, &"hello".to_string()).unwrap();
//!
//! subscription.dispose();
//! engine.dispose();
//! ```

pub mod contract;
pub mod engine;
pub mod error;
pub mod logging;
pub mod processing;
pub mod serialization;
pub mod transport;
pub mod utils;

pub use contract::{Acknowledge, BinaryMessage, Destination, Endpoint, TransportInfo};
pub use engine::{
    MessagingEngine, SendOptions, SubscribeOptions, TypeRouter, DEFAULT_UNACK_DELAY_MS,
};
pub use error::{MessagingError, Result};
pub use processing::{ProcessingGroupInfo, ProcessingGroupStats};
pub use serialization::{
    Message, MessageSerializer, SerializationError, SerializationFormat, SerializationManager,
    SerializerFactory,
};
pub use transport::{
    DestinationUsage, InMemoryTransportFactory, StaticTransportResolver, TransportEvent,
    TransportFactory, TransportResolver,
};
pub use utils::Subscription;
