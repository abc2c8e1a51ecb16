//! # sigil-ledger
//!
//! Append-only, hash-linked conversation history.
//!
//! The [`ConsensusHandler`] is the only place that decides what a
//! conversation's history is. Local transactions are taken only when built
//! on the current tip; remote ones are checked against the sender device's
//! identity key, buffered when their parent is missing and resolved
//! deterministically when they fork.

pub mod chain;
pub mod consensus;
pub mod device;

mod error;
mod persist;

pub use chain::{
    AcceptOutcome, AcceptReport, ConflictNotice, ConversationChain, EntryStatus, SubmitOutcome,
};
pub use consensus::{ChainHandle, ConsensusHandler};
pub use device::DeviceRecord;
pub use error::{ChainError, RejectReason};
