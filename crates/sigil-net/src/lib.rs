//! # sigil-net
//!
//! Transport boundary and the offline Delivery Queue.
//!
//! Wire protocols live outside the core: anything that can implement
//! [`Transport::send`] and feed received transactions into an `mpsc`
//! channel can carry Sigil traffic.

pub mod backoff;
pub mod queue;
pub mod transport;

mod error;

pub use backoff::Backoff;
pub use error::{DeliveryError, TransportError};
pub use queue::{
    DeliveryEvent, DeliveryQueue, DeliveryStatus, QueuedDelivery, RunSummary, TargetStatus,
};
pub use transport::{Ack, LoopbackTransport, ScriptedTransport, Transport};
