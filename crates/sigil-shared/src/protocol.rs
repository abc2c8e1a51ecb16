use serde::{Deserialize, Serialize};

use crate::identity::PublicIdentity;
use crate::types::{GroupId, PeerDevice};

/// Sent with every initiator message until the responder has replied, so the
/// responder can run key agreement on receipt of any of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreKeyHeader {
    pub identity: PublicIdentity,
    /// Initiator's ephemeral X25519 key
    pub ephemeral: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Position of this message in the current sending chain
    pub counter: u32,
}

impl RatchetHeader {
    /// Bytes authenticated as associated data alongside the ciphertext.
    pub fn to_aad(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.previous_chain_length.to_le_bytes());
        out[36..].copy_from_slice(&self.counter.to_le_bytes());
        out
    }
}

/// One pairwise double-ratchet ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetMessage {
    pub prekey: Option<PreKeyHeader>,
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

/// A pairwise ciphertext addressed to one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientCiphertext {
    pub recipient: PeerDevice,
    pub message: RatchetMessage,
}

/// Sender-key chain state handed to a group member over a pairwise session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderKeyDistribution {
    pub group_id: GroupId,
    pub sender: PeerDevice,
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMessage {
    pub group_id: GroupId,
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
}

/// Contents of [`crate::transaction::Transaction::payload`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SealedPayload {
    /// Pairwise fan-out: one ratchet ciphertext per recipient device.
    Direct { recipients: Vec<RecipientCiphertext> },

    /// Sender-key ciphertext, preceded by pairwise-encrypted key
    /// distributions for members that do not hold the current key yet.
    Group {
        distributions: Vec<RecipientCiphertext>,
        message: GroupMessage,
    },
}

impl SealedPayload {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// The pairwise ciphertext addressed to `device`, if any.
    pub fn addressed_to(&self, device: &PeerDevice) -> Option<&RatchetMessage> {
        let list = match self {
            SealedPayload::Direct { recipients } => recipients,
            SealedPayload::Group { distributions, .. } => distributions,
        };
        list.iter()
            .find(|r| &r.recipient == device)
            .map(|r| &r.message)
    }
}

/// WebRTC signaling carried as a [`crate::transaction::PayloadKind::CallSignal`]
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallSignal {
    /// SDP Offer
    Offer(String),
    /// SDP Answer
    Answer(String),
    /// ICE Candidate
    IceCandidate(String),
    /// Call ended
    Hangup,
}

impl CallSignal {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
