//! # sigil-session
//!
//! End-to-end encryption sessions for the Sigil core.
//!
//! The [`KeyStore`] owns the device identity and pre-keys. The
//! [`EncryptionEngine`] runs X3DH key agreement against a peer's
//! [`PreKeyBundle`], then advances a double ratchet per peer device on every
//! encrypt and decrypt. Groups use sender keys distributed over the pairwise
//! sessions. All private state is sealed before it reaches the persistence
//! backend.

pub mod engine;
pub mod key_store;
pub mod ratchet;
pub mod sealed;
pub mod sender_key;
pub mod session_store;
pub mod x3dh;

mod error;

pub use engine::{EncryptionEngine, GroupOutbound};
pub use error::{KeyStoreError, SessionError};
pub use key_store::{KeyStore, PreKeyBundle};
pub use sealed::SealedStore;
pub use session_store::{SessionPhase, TerminationReason};
