//! Signed, hash-linked ledger transactions.
//!
//! A [`Transaction`] is the only unit exchanged between devices. Its hash
//! (see [`Transaction::hash`]) is both the Ed25519 signing digest and the
//! value the next transaction in the conversation links to through
//! `previous_hash`.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::constants::{KDF_CONTEXT_TRANSACTION, MAX_PAYLOAD_SIZE, TRANSACTION_VERSION};
use crate::error::TransactionError;
use crate::identity::{verify_signature, IdentityKeyPair};
use crate::time::Clock;
use crate::types::{ConversationId, DeviceId, MessageId, PeerDevice, TxHash, UserId};

/// What the sealed payload of a transaction carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// Ordinary chat message
    Message = 0x01,
    /// Call-setup signaling (offer/answer/ICE/hangup)
    CallSignal = 0x02,
}

impl PayloadKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Message),
            0x02 => Some(Self::CallSignal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub previous_hash: TxHash,
    pub kind: PayloadKind,
    /// Sealed payload (bincode-encoded ciphertext envelope)
    pub payload: Vec<u8>,
    pub sender_id: UserId,
    pub sender_device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    /// Ed25519 signature over [`Transaction::hash`]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Digest over every field except the signature.
    pub fn hash(&self) -> TxHash {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_TRANSACTION);
        hasher.update(&[TRANSACTION_VERSION]);
        hasher.update(&self.previous_hash.0);
        hasher.update(self.conversation_id.0.as_bytes());
        hasher.update(self.id.0.as_bytes());
        hasher.update(&[self.kind as u8]);
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.update(&self.sender_id.0);
        hasher.update(&self.sender_device_id.0.to_le_bytes());
        hasher.update(&self.timestamp.timestamp().to_le_bytes());
        hasher.update(&self.timestamp.timestamp_subsec_nanos().to_le_bytes());
        TxHash(*hasher.finalize().as_bytes())
    }

    pub fn sender(&self) -> PeerDevice {
        PeerDevice::new(self.sender_id, self.sender_device_id)
    }

    /// Check the signature against the sending device's public key.
    pub fn verify(&self, signing_key: &[u8; 32]) -> Result<(), TransactionError> {
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TransactionError::SignatureInvalid)?;
        verify_signature(signing_key, &self.hash().0, &signature)
            .map_err(|_| TransactionError::SignatureInvalid)
    }

    /// Deterministic fork tie-break: earlier timestamp wins, then sender id,
    /// then device id, then hash.
    pub fn ordering_key(&self) -> (DateTime<Utc>, UserId, DeviceId, TxHash) {
        (
            self.timestamp,
            self.sender_id,
            self.sender_device_id,
            self.hash(),
        )
    }

    pub fn cmp_priority(&self, other: &Transaction) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(data).map_err(|e| TransactionError::Malformed(e.to_string()))
    }
}

/// Wraps ciphertext into signed transactions for the local device.
///
/// Stateless apart from the clock read, so one signer can serve every
/// conversation concurrently.
#[derive(Clone)]
pub struct TransactionSigner {
    local: PeerDevice,
    clock: Arc<dyn Clock>,
}

impl TransactionSigner {
    pub fn new(local: PeerDevice, clock: Arc<dyn Clock>) -> Self {
        Self { local, clock }
    }

    pub fn local(&self) -> PeerDevice {
        self.local
    }

    pub fn sign(
        &self,
        identity: &IdentityKeyPair,
        conversation_id: ConversationId,
        kind: PayloadKind,
        ciphertext: Vec<u8>,
        previous_hash: TxHash,
    ) -> Result<Transaction, TransactionError> {
        self.sign_with_id(
            identity,
            MessageId::new(),
            conversation_id,
            kind,
            ciphertext,
            previous_hash,
        )
    }

    pub fn sign_with_id(
        &self,
        identity: &IdentityKeyPair,
        id: MessageId,
        conversation_id: ConversationId,
        kind: PayloadKind,
        ciphertext: Vec<u8>,
        previous_hash: TxHash,
    ) -> Result<Transaction, TransactionError> {
        if ciphertext.len() > MAX_PAYLOAD_SIZE {
            return Err(TransactionError::PayloadTooLarge {
                size: ciphertext.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut tx = Transaction {
            id,
            conversation_id,
            previous_hash,
            kind,
            payload: ciphertext,
            sender_id: self.local.user,
            sender_device_id: self.local.device,
            timestamp: self.clock.now(),
            signature: Vec::new(),
        };
        tx.signature = identity.sign(&tx.hash().0).to_bytes().to_vec();
        Ok(tx)
    }
}
