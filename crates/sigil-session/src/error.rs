use sigil_shared::{CryptoError, GroupId, PeerDevice};
use sigil_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Identity already exists")]
    IdentityExists,

    #[error("No identity has been generated")]
    NoIdentity,

    #[error("One-time pre-key {0} not found (unknown or already consumed)")]
    NotFound(u32),

    #[error("Signed pre-key {0} is unknown or expired")]
    UnknownSignedPreKey(u32),

    #[error("No signed pre-key has been generated")]
    NoSignedPreKey,

    #[error("Signed pre-key signature does not verify")]
    InvalidSignedPreKey,

    #[error("Invalid pre-key bundle: {0}")]
    InvalidBundle(String),

    #[error("Sealed key material could not be opened: {0}")]
    Sealed(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No established session with {0}")]
    SessionNotEstablished(PeerDevice),

    #[error("Message counter already used or too old")]
    ReplayOrTooOld,

    #[error("Counter gap of {gap} exceeds the limit of {max}")]
    CounterGapTooLarge { gap: u32, max: u32 },

    #[error("Message authentication failed")]
    DecryptionFailed,

    #[error("No sender key from {sender} for group {group}")]
    UnknownSenderKey { group: GroupId, sender: PeerDevice },

    #[error("Sender key distribution claims {claimed} but arrived from {actual}")]
    SenderKeyMismatch {
        claimed: PeerDevice,
        actual: PeerDevice,
    },

    #[error("Malformed plaintext: {0}")]
    Malformed(String),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Errors caused by the incoming data rather than local state.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SessionError::ReplayOrTooOld
                | SessionError::CounterGapTooLarge { .. }
                | SessionError::DecryptionFailed
                | SessionError::SenderKeyMismatch { .. }
                | SessionError::Malformed(_)
        )
    }
}
