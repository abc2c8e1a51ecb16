//! Encryption engine: session establishment and per-message ratchet
//! operations on top of the key store and session store.

use std::sync::Arc;

use sigil_shared::config::SessionConfig;
use sigil_shared::protocol::{GroupMessage, PreKeyHeader, RatchetMessage, SenderKeyDistribution};
use sigil_shared::{GroupId, PeerDevice, PublicIdentity};
use tracing::{debug, info, warn};

use crate::error::{KeyStoreError, SessionError};
use crate::key_store::{KeyStore, PreKeyBundle};
use crate::ratchet::RatchetState;
use crate::sealed::SealedStore;
use crate::sender_key::{SenderKeyState, SenderKeyStore};
use crate::session_store::{
    SessionPhase, SessionRecord, SessionState, SessionStore, TerminationReason,
};
use crate::x3dh;

/// Sender-key material produced by [`EncryptionEngine::group_encrypt`].
#[derive(Debug, Clone)]
pub struct GroupOutbound {
    /// Current chain handed to members that have not seen it yet. Each must
    /// travel over the pairwise session with that member.
    pub distributions: Vec<(PeerDevice, SenderKeyDistribution)>,
    pub message: GroupMessage,
}

pub struct EncryptionEngine {
    local: PeerDevice,
    keys: Arc<KeyStore>,
    sessions: SessionStore,
    sender_keys: SenderKeyStore,
    config: SessionConfig,
}

impl EncryptionEngine {
    pub fn new(
        local: PeerDevice,
        keys: Arc<KeyStore>,
        sealed: SealedStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            local,
            keys,
            sessions: SessionStore::new(sealed.clone()),
            sender_keys: SenderKeyStore::new(sealed),
            config,
        }
    }

    pub fn local(&self) -> PeerDevice {
        self.local
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub async fn phase(&self, peer: PeerDevice) -> Result<SessionPhase, SessionError> {
        let handle = self.sessions.handle(peer)?;
        let record = handle.lock().await;
        Ok(record.state.phase())
    }

    /// Run key agreement against `bundle` and store the resulting session.
    /// Replaces any existing session with the device.
    pub async fn establish_outbound(
        &self,
        peer: PeerDevice,
        bundle: &PreKeyBundle,
    ) -> Result<(), SessionError> {
        let (agreement, header) = self
            .keys
            .with_identity(|identity| x3dh::initiate(identity, bundle))
            .await??;

        let handle = self.sessions.handle(peer)?;
        let mut record = handle.lock().await;
        note_identity_change(&mut record, &bundle.identity);

        let state = RatchetState::initiator(
            agreement,
            header,
            bundle.identity,
            bundle.signed_prekey.public,
        );
        record.state = SessionState::Established(Box::new(state));
        record.remote_identity = Some(bundle.identity);
        self.sessions.persist(&record)?;

        info!(peer = %peer, "Session established (initiator)");
        Ok(())
    }

    pub async fn encrypt(
        &self,
        peer: PeerDevice,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, SessionError> {
        let handle = self.sessions.handle(peer)?;
        let mut record = handle.lock().await;

        let state = record
            .state
            .ratchet()
            .filter(|state| state.can_send())
            .ok_or(SessionError::SessionNotEstablished(peer))?;
        let mut next = state.clone();
        let message = next.encrypt(plaintext)?;

        record.state = SessionState::Ratcheting(Box::new(next));
        self.sessions.persist(&record)?;

        debug!(peer = %peer, counter = message.header.counter, "Encrypted message");
        Ok(message)
    }

    pub async fn decrypt(
        &self,
        peer: PeerDevice,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let handle = self.sessions.handle(peer)?;
        let mut record = handle.lock().await;

        // A pre-key header for the session already held is just a message
        // sent before the initiator saw our reply.
        let existing = record
            .state
            .ratchet()
            .filter(|state| match &message.prekey {
                Some(prekey) => state.base_key() == &prekey.ephemeral,
                None => true,
            })
            .cloned();

        let (plaintext, next) = match (existing, &message.prekey) {
            (Some(state), _) => state.decrypt(message, &self.config)?,
            (None, Some(prekey)) => {
                let (plaintext, next) = self.accept_prekey_message(peer, prekey, message).await?;
                note_identity_change(&mut record, &prekey.identity);
                record.remote_identity = Some(prekey.identity);
                info!(peer = %peer, "Session established (responder)");
                (plaintext, next)
            }
            (None, None) => return Err(SessionError::SessionNotEstablished(peer)),
        };

        record.state = SessionState::Ratcheting(Box::new(next));
        self.sessions.persist(&record)?;

        debug!(peer = %peer, counter = message.header.counter, "Decrypted message");
        Ok(plaintext)
    }

    /// Responder side of key agreement. The one-time pre-key is burned only
    /// after the first message authenticated under the derived keys.
    async fn accept_prekey_message(
        &self,
        peer: PeerDevice,
        prekey: &PreKeyHeader,
        message: &RatchetMessage,
    ) -> Result<(Vec<u8>, RatchetState), SessionError> {
        debug!(
            peer = %peer,
            signed_prekey = prekey.signed_prekey_id,
            one_time_prekey = ?prekey.one_time_prekey_id,
            "Responding to key agreement"
        );
        let signed = self.keys.signed_prekey_secret(prekey.signed_prekey_id).await?;
        let one_time = match prekey.one_time_prekey_id {
            Some(id) => Some(
                self.keys
                    .peek_one_time_prekey(id)
                    .await
                    .map_err(replay_if_consumed)?,
            ),
            None => None,
        };

        let agreement = self
            .keys
            .with_identity(|identity| x3dh::respond(identity, prekey, &signed, one_time.as_ref()))
            .await?;
        let state = RatchetState::responder(agreement, &signed, prekey.identity, prekey.ephemeral);
        let (plaintext, next) = state.decrypt(message, &self.config)?;

        if let Some(id) = prekey.one_time_prekey_id {
            self.keys
                .consume_one_time_prekey(id)
                .await
                .map_err(replay_if_consumed)?;
        }
        Ok((plaintext, next))
    }

    /// Terminate the session with `peer`. A new key agreement is required
    /// before further messages.
    pub async fn reset_session(&self, peer: PeerDevice) -> Result<(), SessionError> {
        let handle = self.sessions.handle(peer)?;
        let mut record = handle.lock().await;
        record.state = SessionState::Terminated(TerminationReason::Reset);
        self.sessions.persist(&record)?;

        info!(peer = %peer, "Session reset");
        Ok(())
    }

    /// Make sure the local sender key for `group` matches `members`,
    /// rotating it when membership changed. Returns the current key id.
    pub async fn ensure_sender_key(
        &self,
        group: GroupId,
        members: &[PeerDevice],
    ) -> Result<u32, SessionError> {
        let handle = self.sender_keys.handle(group, self.local)?;
        let mut slot = handle.lock().await;
        let key_id = self.ensure_sender_key_locked(&mut slot, group, members)?;
        Ok(key_id)
    }

    fn ensure_sender_key_locked(
        &self,
        slot: &mut Option<SenderKeyState>,
        group: GroupId,
        members: &[PeerDevice],
    ) -> Result<u32, SessionError> {
        if let Some(state) = slot.as_ref().filter(|s| s.matches_members(members)) {
            return Ok(state.key_id);
        }

        let key_id = slot.as_ref().map_or(1, |s| s.key_id.wrapping_add(1));
        let state = SenderKeyState::outbound(group, self.local, key_id, members);
        self.sender_keys.persist(&state)?;
        *slot = Some(state);

        info!(group = %group, key_id, members = members.len(), "Sender key rotated");
        Ok(key_id)
    }

    /// Encrypt for a group under the local sender key, returning the
    /// distributions still owed to `members`.
    pub async fn group_encrypt(
        &self,
        group: GroupId,
        members: &[PeerDevice],
        plaintext: &[u8],
    ) -> Result<GroupOutbound, SessionError> {
        let handle = self.sender_keys.handle(group, self.local)?;
        let mut slot = handle.lock().await;
        self.ensure_sender_key_locked(&mut slot, group, members)?;
        let state = slot
            .as_mut()
            .ok_or(SessionError::UnknownSenderKey {
                group,
                sender: self.local,
            })?;

        let distribution = state.distribution();
        let distributions = members
            .iter()
            .filter(|member| state.needs_distribution(member))
            .map(|member| (*member, distribution.clone()))
            .collect();

        let mut next = state.clone();
        let message = next.encrypt(plaintext)?;
        self.sender_keys.persist(&next)?;
        *state = next;

        Ok(GroupOutbound {
            distributions,
            message,
        })
    }

    /// Record that `members` now hold sender key `key_id`.
    pub async fn mark_distributed(
        &self,
        group: GroupId,
        key_id: u32,
        members: impl IntoIterator<Item = PeerDevice>,
    ) -> Result<(), SessionError> {
        let handle = self.sender_keys.handle(group, self.local)?;
        let mut slot = handle.lock().await;
        if let Some(state) = slot.as_mut().filter(|s| s.key_id == key_id) {
            state.mark_distributed(members);
            self.sender_keys.persist(state)?;
        }
        Ok(())
    }

    /// Install a sender key received from `from` over a pairwise session.
    pub async fn process_distribution(
        &self,
        from: PeerDevice,
        distribution: &SenderKeyDistribution,
    ) -> Result<(), SessionError> {
        if distribution.sender != from {
            return Err(SessionError::SenderKeyMismatch {
                claimed: distribution.sender,
                actual: from,
            });
        }

        let handle = self.sender_keys.handle(distribution.group_id, from)?;
        let mut slot = handle.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.key_id >= distribution.key_id {
                debug!(group = %distribution.group_id, sender = %from, "Stale sender key ignored");
                return Ok(());
            }
        }

        let state = SenderKeyState::from_distribution(distribution);
        self.sender_keys.persist(&state)?;
        *slot = Some(state);

        debug!(
            group = %distribution.group_id,
            sender = %from,
            key_id = distribution.key_id,
            "Sender key installed"
        );
        Ok(())
    }

    pub async fn group_decrypt(
        &self,
        sender: PeerDevice,
        message: &GroupMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let group = message.group_id;
        let handle = self.sender_keys.handle(group, sender)?;
        let mut slot = handle.lock().await;

        let state = slot
            .as_ref()
            .ok_or(SessionError::UnknownSenderKey { group, sender })?;
        if message.key_id < state.key_id {
            return Err(SessionError::ReplayOrTooOld);
        }
        if message.key_id > state.key_id {
            return Err(SessionError::UnknownSenderKey { group, sender });
        }

        let (plaintext, next) = state.decrypt(message, &self.config)?;
        self.sender_keys.persist(&next)?;
        *slot = Some(next);
        Ok(plaintext)
    }
}

fn note_identity_change(record: &mut SessionRecord, identity: &PublicIdentity) {
    if let Some(previous) = record.remote_identity {
        if previous != *identity {
            warn!(peer = %record.peer, "Peer identity key changed, previous session terminated");
            record.state = SessionState::Terminated(TerminationReason::IdentityChanged);
        }
    }
}

fn replay_if_consumed(err: KeyStoreError) -> SessionError {
    match err {
        KeyStoreError::NotFound(_) => SessionError::ReplayOrTooOld,
        other => SessionError::KeyStore(other),
    }
}
