//! Group sender keys.
//!
//! Each (group, sender device) pair owns a symmetric chain. The sender hands
//! the current chain key to every member over pairwise sessions; members
//! then advance it locally per message. The chain is replaced whenever group
//! membership changes, detected through a membership fingerprint.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sigil_shared::config::SessionConfig;
use sigil_shared::constants::KDF_CONTEXT_MEMBERSHIP;
use sigil_shared::crypto::{self, SymmetricKey};
use sigil_shared::protocol::{GroupMessage, SenderKeyDistribution};
use sigil_shared::{GroupId, PeerDevice};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::SessionError;
use crate::sealed::SealedStore;

/// Order-independent digest of a member list.
pub fn membership_fingerprint(members: &[PeerDevice]) -> [u8; 32] {
    let sorted: BTreeSet<&PeerDevice> = members.iter().collect();
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MEMBERSHIP);
    for member in sorted {
        hasher.update(&member.user.0);
        hasher.update(&member.device.0.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub group: GroupId,
    pub sender: PeerDevice,
    pub key_id: u32,
    chain_key: SymmetricKey,
    iteration: u32,
    skipped: VecDeque<(u32, SymmetricKey)>,
    members_fingerprint: [u8; 32],
    /// Devices that already hold this key (sender side only)
    distributed_to: BTreeSet<PeerDevice>,
}

impl fmt::Debug for SenderKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyState")
            .field("group", &self.group)
            .field("sender", &self.sender)
            .field("key_id", &self.key_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl SenderKeyState {
    pub fn outbound(group: GroupId, sender: PeerDevice, key_id: u32, members: &[PeerDevice]) -> Self {
        Self {
            group,
            sender,
            key_id,
            chain_key: crypto::generate_symmetric_key(),
            iteration: 0,
            skipped: VecDeque::new(),
            members_fingerprint: membership_fingerprint(members),
            distributed_to: BTreeSet::new(),
        }
    }

    pub fn from_distribution(dist: &SenderKeyDistribution) -> Self {
        Self {
            group: dist.group_id,
            sender: dist.sender,
            key_id: dist.key_id,
            chain_key: dist.chain_key,
            iteration: dist.iteration,
            skipped: VecDeque::new(),
            members_fingerprint: [0u8; 32],
            distributed_to: BTreeSet::new(),
        }
    }

    pub fn matches_members(&self, members: &[PeerDevice]) -> bool {
        self.members_fingerprint == membership_fingerprint(members)
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Distribution at the current iteration: recipients can read this and
    /// later messages, never earlier ones.
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            group_id: self.group,
            sender: self.sender,
            key_id: self.key_id,
            iteration: self.iteration,
            chain_key: self.chain_key,
        }
    }

    pub fn needs_distribution(&self, member: &PeerDevice) -> bool {
        member != &self.sender && !self.distributed_to.contains(member)
    }

    pub fn mark_distributed(&mut self, members: impl IntoIterator<Item = PeerDevice>) {
        self.distributed_to.extend(members);
    }

    fn aad(&self, iteration: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + 36 + 8);
        aad.extend_from_slice(self.group.0.as_bytes());
        aad.extend_from_slice(&self.sender.user.0);
        aad.extend_from_slice(&self.sender.device.0.to_le_bytes());
        aad.extend_from_slice(&self.key_id.to_le_bytes());
        aad.extend_from_slice(&iteration.to_le_bytes());
        aad
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupMessage, SessionError> {
        let (message_key, next_chain) = crypto::kdf_chain(&self.chain_key);
        let ciphertext = crypto::seal(
            &message_key,
            &crypto::message_nonce(&message_key),
            &self.aad(self.iteration),
            plaintext,
        )?;

        let message = GroupMessage {
            group_id: self.group,
            key_id: self.key_id,
            iteration: self.iteration,
            ciphertext,
        };
        self.chain_key = next_chain;
        self.iteration += 1;
        Ok(message)
    }

    /// Same contract as the pairwise ratchet: works on a copy and hands it
    /// back only when authentication succeeded.
    pub fn decrypt(
        &self,
        message: &GroupMessage,
        config: &SessionConfig,
    ) -> Result<(Vec<u8>, SenderKeyState), SessionError> {
        let mut next = self.clone();

        if let Some(pos) = next.skipped.iter().position(|(i, _)| *i == message.iteration) {
            let (_, message_key) = next.skipped[pos];
            let plaintext = next.open(&message_key, message)?;
            next.skipped.remove(pos);
            return Ok((plaintext, next));
        }

        if message.iteration < next.iteration {
            return Err(SessionError::ReplayOrTooOld);
        }

        let gap = message.iteration - next.iteration;
        if gap > config.max_skipped_keys {
            return Err(SessionError::CounterGapTooLarge {
                gap,
                max: config.max_skipped_keys,
            });
        }

        while next.iteration < message.iteration {
            let (message_key, next_chain) = crypto::kdf_chain(&next.chain_key);
            next.skipped.push_back((next.iteration, message_key));
            next.chain_key = next_chain;
            next.iteration += 1;
        }
        while next.skipped.len() > config.max_stored_skipped_keys {
            next.skipped.pop_front();
        }

        let (message_key, next_chain) = crypto::kdf_chain(&next.chain_key);
        let plaintext = next.open(&message_key, message)?;
        next.chain_key = next_chain;
        next.iteration += 1;
        Ok((plaintext, next))
    }

    fn open(&self, message_key: &SymmetricKey, message: &GroupMessage) -> Result<Vec<u8>, SessionError> {
        crypto::open(
            message_key,
            &crypto::message_nonce(message_key),
            &self.aad(message.iteration),
            &message.ciphertext,
        )
        .map_err(|_| SessionError::DecryptionFailed)
    }
}

pub type SenderKeyHandle = Arc<AsyncMutex<Option<SenderKeyState>>>;

/// Sender-key states keyed by (group, sender device), one lock per key.
pub struct SenderKeyStore {
    states: Mutex<HashMap<(GroupId, PeerDevice), SenderKeyHandle>>,
    sealed: SealedStore,
}

impl SenderKeyStore {
    pub fn new(sealed: SealedStore) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            sealed,
        }
    }

    fn storage_key(group: &GroupId, sender: &PeerDevice) -> String {
        format!("senderkey:{}:{}", group, sender.storage_key())
    }

    pub fn handle(&self, group: GroupId, sender: PeerDevice) -> Result<SenderKeyHandle, SessionError> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = states.get(&(group, sender)) {
            return Ok(handle.clone());
        }

        let state = self
            .sealed
            .get::<SenderKeyState>(&Self::storage_key(&group, &sender))?;
        let handle = Arc::new(AsyncMutex::new(state));
        states.insert((group, sender), handle.clone());
        Ok(handle)
    }

    pub fn persist(&self, state: &SenderKeyState) -> Result<(), SessionError> {
        self.sealed
            .put(&Self::storage_key(&state.group, &state.sender), state)?;
        Ok(())
    }
}
