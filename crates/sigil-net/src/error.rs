use serde::{Deserialize, Serialize};
use sigil_shared::{MessageId, PeerDevice};
use sigil_store::StoreError;
use thiserror::Error;

/// A single failed send. Always recoverable: the Delivery Queue retries it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("No network connectivity")]
    Offline,

    #[error("Peer device {0} is unreachable")]
    Unreachable(PeerDevice),

    #[error("Send timed out")]
    Timeout,

    #[error("Peer refused the transaction: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Terminal: every retry was used up.
    #[error("Delivery of {message_id} to {target} abandoned after {attempts} attempts: {last_error}")]
    QueueAbandoned {
        message_id: MessageId,
        target: PeerDevice,
        attempts: u32,
        last_error: TransportError,
    },

    #[error("Queued delivery record is corrupt: {0}")]
    Corrupt(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
