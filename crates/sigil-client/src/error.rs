use sigil_ledger::{ChainError, RejectReason};
use sigil_net::DeliveryError;
use sigil_session::{KeyStoreError, SessionError};
use sigil_shared::{ConversationId, MessageId, PeerDevice, TransactionError};
use sigil_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("Conversation {0} already registered")]
    ConversationExists(ConversationId),

    #[error("No outgoing message {0}")]
    UnknownMessage(MessageId),

    #[error("{0} is not a member of conversation {1}")]
    NotAMember(PeerDevice, ConversationId),

    /// The local chain refused our own transaction.
    #[error("Transaction rejected: {0}")]
    Rejected(RejectReason),

    #[error("Payload encoding failed: {0}")]
    Codec(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<bincode::Error> for ClientError {
    fn from(e: bincode::Error) -> Self {
        ClientError::Codec(e.to_string())
    }
}
