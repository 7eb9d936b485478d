//! # Processing Groups
//!
//! Concurrency compartments for message callbacks. Each named group runs its
//! callbacks either inline on the transport delivery thread (concurrency 0)
//! or on a dedicated bounded worker pool with priority lanes. The manager
//! owns the groups, the resubscription schedule, and deferred
//! acknowledgements.

mod group;
mod manager;
mod scheduling;

pub use group::{ProcessingGroupInfo, ProcessingGroupStats};
pub use manager::ProcessingGroupManager;
pub(crate) use manager::{MessageHandler, SessionProvider};
