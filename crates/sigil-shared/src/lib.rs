//! # sigil-shared
//!
//! Types shared by every Sigil crate: identifiers, the error taxonomy,
//! AEAD/KDF primitives, device identity keys, the signed [`Transaction`]
//! with its [`TransactionSigner`], sealed payload envelopes, the clock
//! abstraction and configuration.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod time;
pub mod transaction;
pub mod types;

pub use config::SigilConfig;
pub use error::{CryptoError, IdentityError, TransactionError};
pub use identity::{IdentityKeyPair, PublicIdentity};
pub use time::{Clock, ManualClock, SystemClock};
pub use transaction::{PayloadKind, Transaction, TransactionSigner};
pub use types::{ConversationId, DeviceId, GroupId, MessageId, PeerDevice, TxHash, UserId};
