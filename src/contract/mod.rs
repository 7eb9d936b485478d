//! # Messaging Contract Types
//!
//! Wire-independent value types shared by callers and transports: where a
//! message goes ([`Endpoint`], [`Destination`]), what travels on the wire
//! ([`BinaryMessage`]), which broker it rides ([`TransportInfo`]), and how a
//! delivery is settled ([`Acknowledge`]).

mod ack;
mod destination;
mod endpoint;
mod message;
mod transport_info;

pub use ack::{Acknowledge, RawAck};
pub use destination::Destination;
pub use endpoint::Endpoint;
pub use message::BinaryMessage;
pub use transport_info::TransportInfo;
