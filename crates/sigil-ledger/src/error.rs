use sigil_shared::{ConversationId, PeerDevice, TxHash};
use sigil_store::StoreError;
use thiserror::Error;

/// Why a transaction was refused. Refusals are per transaction and never
/// poison the chain for later ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Sender device {0} is not a participant")]
    UnknownDevice(PeerDevice),

    #[error("Signature does not verify against the sender's identity key")]
    SignatureInvalid,

    #[error("Built on {actual} but the tip is {expected}")]
    StaleTip { expected: TxHash, actual: TxHash },

    #[error("Transaction belongs to conversation {0}")]
    WrongConversation(ConversationId),

    #[error("Too many transactions waiting for a missing parent")]
    PendingBufferFull,
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("Conversation {0} already exists")]
    ConversationExists(ConversationId),

    /// History needed to resolve a fork is not available locally.
    #[error("Missing ancestor {0} while resolving a fork")]
    MissingAncestor(TxHash),

    #[error("Unknown participant {0}")]
    UnknownParticipant(PeerDevice),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
