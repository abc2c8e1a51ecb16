//! Conversation registry: who takes part in which conversation, and how
//! their messages are sealed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sigil_ledger::DeviceRecord;
use sigil_shared::{ConversationId, GroupId, MessageId, PeerDevice, PublicIdentity, TxHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// Pairwise ratchet ciphertext for every member device
    Direct,
    /// One sender-key ciphertext shared by all member devices
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub device: PeerDevice,
    pub identity: PublicIdentity,
}

impl Participant {
    pub fn new(device: PeerDevice, identity: PublicIdentity) -> Self {
        Self { device, identity }
    }

    pub(crate) fn device_record(&self) -> DeviceRecord {
        DeviceRecord::new(self.device, self.identity.signing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participants: Vec<Participant>,
}

impl Conversation {
    pub(crate) fn storage_key(id: &ConversationId) -> String {
        format!("conversation:{id}")
    }

    /// Every participant device except `local`.
    pub fn recipients(&self, local: &PeerDevice) -> Vec<PeerDevice> {
        self.participants
            .iter()
            .map(|p| p.device)
            .filter(|d| d != local)
            .collect()
    }

    pub fn participant(&self, device: &PeerDevice) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.device == device)
    }
}

/// What the local device remembers about a message it sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    pub message_id: MessageId,
    pub conversation: ConversationId,
    pub hash: TxHash,
    pub sequence: u64,
    /// Set once the sender withdrew the message. The transaction stays in
    /// the chain.
    pub tombstoned_at: Option<DateTime<Utc>>,
    /// Devices that never received the message: every retry was used up.
    #[serde(default)]
    pub abandoned: Vec<PeerDevice>,
}

impl SentRecord {
    pub(crate) fn storage_key(id: &MessageId) -> String {
        format!("sent:{id}")
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    pub fn is_abandoned_for(&self, device: &PeerDevice) -> bool {
        self.abandoned.contains(device)
    }
}
