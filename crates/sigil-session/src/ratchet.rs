//! Pairwise double ratchet.
//!
//! Every message advances a symmetric chain; every change of the remote
//! ratchet public key mixes a fresh Diffie-Hellman output into the root key
//! and starts new chains. Keys for messages that arrive out of order are
//! buffered, bounded per gap and in total.

use std::collections::VecDeque;
use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sigil_shared::config::SessionConfig;
use sigil_shared::crypto::{self, SymmetricKey};
use sigil_shared::protocol::{PreKeyHeader, RatchetHeader, RatchetMessage};
use sigil_shared::{CryptoError, PublicIdentity};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use crate::error::SessionError;
use crate::x3dh::AgreementOutput;

/// Remote ratchet keys remembered after they were replaced, so late
/// messages on a finished chain are reported as replays.
const MAX_RETIRED_RATCHET_KEYS: usize = 32;

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    counter: u32,
    message_key: SymmetricKey,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: SymmetricKey,
    self_ratchet_secret: [u8; 32],
    self_ratchet_public: [u8; 32],
    remote_ratchet_key: Option<[u8; 32]>,
    sending_chain: Option<SymmetricKey>,
    receiving_chain: Option<SymmetricKey>,
    send_counter: u32,
    receive_counter: u32,
    previous_send_counter: u32,
    skipped: VecDeque<SkippedKey>,
    retired_remote_keys: VecDeque<[u8; 32]>,
    associated_data: Vec<u8>,
    /// Attached to outgoing messages until the peer has answered
    pending_prekey: Option<PreKeyHeader>,
    remote_identity: PublicIdentity,
    /// Initiator ephemeral key the session was agreed with
    base_key: [u8; 32],
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_counter", &self.send_counter)
            .field("receive_counter", &self.receive_counter)
            .field("previous_send_counter", &self.previous_send_counter)
            .field("skipped", &self.skipped.len())
            .field("awaiting_reply", &self.pending_prekey.is_some())
            .finish_non_exhaustive()
    }
}

impl RatchetState {
    /// Initiator state right after agreement: the sending chain is derived
    /// against the responder's signed pre-key, which doubles as its first
    /// ratchet key.
    pub fn initiator(
        agreement: AgreementOutput,
        header: PreKeyHeader,
        remote_identity: PublicIdentity,
        remote_signed_prekey: [u8; 32],
    ) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = AgreementPublic::from(&secret).to_bytes();
        let dh = dh(&secret.to_bytes(), &remote_signed_prekey);
        let (root_key, sending_chain) = crypto::kdf_root(&agreement.shared_secret, &dh);

        Self {
            root_key,
            self_ratchet_secret: secret.to_bytes(),
            self_ratchet_public: public,
            remote_ratchet_key: Some(remote_signed_prekey),
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            send_counter: 0,
            receive_counter: 0,
            previous_send_counter: 0,
            skipped: VecDeque::new(),
            retired_remote_keys: VecDeque::new(),
            associated_data: agreement.associated_data,
            base_key: header.ephemeral,
            pending_prekey: Some(header),
            remote_identity,
        }
    }

    /// Responder state before the first message is opened. It cannot send
    /// until [`RatchetState::decrypt`] has run the first DH ratchet step.
    pub fn responder(
        agreement: AgreementOutput,
        signed_prekey: &StaticSecret,
        remote_identity: PublicIdentity,
        base_key: [u8; 32],
    ) -> Self {
        Self {
            root_key: agreement.shared_secret,
            self_ratchet_secret: signed_prekey.to_bytes(),
            self_ratchet_public: AgreementPublic::from(signed_prekey).to_bytes(),
            remote_ratchet_key: None,
            sending_chain: None,
            receiving_chain: None,
            send_counter: 0,
            receive_counter: 0,
            previous_send_counter: 0,
            skipped: VecDeque::new(),
            retired_remote_keys: VecDeque::new(),
            associated_data: agreement.associated_data,
            pending_prekey: None,
            remote_identity,
            base_key,
        }
    }

    pub fn can_send(&self) -> bool {
        self.sending_chain.is_some()
    }

    pub fn remote_identity(&self) -> &PublicIdentity {
        &self.remote_identity
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    pub fn receive_counter(&self) -> u32 {
        self.receive_counter
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt and advance the sending chain. The result depends only on
    /// the current chain key, never on fresh randomness.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, SessionError> {
        let chain = self
            .sending_chain
            .ok_or(SessionError::Crypto(CryptoError::EncryptionFailed))?;
        let (message_key, next_chain) = crypto::kdf_chain(&chain);

        let header = RatchetHeader {
            ratchet_key: self.self_ratchet_public,
            previous_chain_length: self.previous_send_counter,
            counter: self.send_counter,
        };
        let ciphertext = crypto::seal(
            &message_key,
            &crypto::message_nonce(&message_key),
            &self.aad(&header),
            plaintext,
        )?;

        self.sending_chain = Some(next_chain);
        self.send_counter += 1;

        Ok(RatchetMessage {
            prekey: self.pending_prekey.clone(),
            header,
            ciphertext,
        })
    }

    /// Decrypt `message` against a copy of this state. The advanced state is
    /// returned alongside the plaintext and is only meant to replace `self`
    /// once the caller has accepted the result.
    pub fn decrypt(
        &self,
        message: &RatchetMessage,
        config: &SessionConfig,
    ) -> Result<(Vec<u8>, RatchetState), SessionError> {
        let mut next = self.clone();
        let header = &message.header;

        if let Some(pos) = next
            .skipped
            .iter()
            .position(|k| k.ratchet_key == header.ratchet_key && k.counter == header.counter)
        {
            let message_key = next.skipped[pos].message_key;
            let plaintext = next.open(&message_key, message)?;
            next.skipped.remove(pos);
            next.pending_prekey = None;
            return Ok((plaintext, next));
        }

        if next.retired_remote_keys.contains(&header.ratchet_key) {
            return Err(SessionError::ReplayOrTooOld);
        }

        if next.remote_ratchet_key != Some(header.ratchet_key) {
            next.skip_message_keys(header.previous_chain_length, config)?;
            next.dh_ratchet(header.ratchet_key);
        }

        if header.counter < next.receive_counter {
            return Err(SessionError::ReplayOrTooOld);
        }
        next.skip_message_keys(header.counter, config)?;

        let chain = next.receiving_chain.ok_or(SessionError::DecryptionFailed)?;
        let (message_key, next_chain) = crypto::kdf_chain(&chain);
        let plaintext = next.open(&message_key, message)?;

        next.receiving_chain = Some(next_chain);
        next.receive_counter += 1;
        next.pending_prekey = None;
        Ok((plaintext, next))
    }

    fn aad(&self, header: &RatchetHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + 40);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&header.to_aad());
        aad
    }

    fn open(&self, message_key: &SymmetricKey, message: &RatchetMessage) -> Result<Vec<u8>, SessionError> {
        crypto::open(
            message_key,
            &crypto::message_nonce(message_key),
            &self.aad(&message.header),
            &message.ciphertext,
        )
        .map_err(|_| SessionError::DecryptionFailed)
    }

    /// Derive and buffer receiving-chain keys up to (not including) `until`.
    fn skip_message_keys(&mut self, until: u32, config: &SessionConfig) -> Result<(), SessionError> {
        let (Some(mut chain), Some(ratchet_key)) = (self.receiving_chain, self.remote_ratchet_key)
        else {
            return Ok(());
        };
        if until <= self.receive_counter {
            return Ok(());
        }

        let gap = until - self.receive_counter;
        if gap > config.max_skipped_keys {
            return Err(SessionError::CounterGapTooLarge {
                gap,
                max: config.max_skipped_keys,
            });
        }

        while self.receive_counter < until {
            let (message_key, next_chain) = crypto::kdf_chain(&chain);
            self.skipped.push_back(SkippedKey {
                ratchet_key,
                counter: self.receive_counter,
                message_key,
            });
            chain = next_chain;
            self.receive_counter += 1;
        }
        self.receiving_chain = Some(chain);

        while self.skipped.len() > config.max_stored_skipped_keys {
            self.skipped.pop_front();
        }
        Ok(())
    }

    fn dh_ratchet(&mut self, remote: [u8; 32]) {
        if let Some(old) = self.remote_ratchet_key.replace(remote) {
            self.retired_remote_keys.push_back(old);
            if self.retired_remote_keys.len() > MAX_RETIRED_RATCHET_KEYS {
                self.retired_remote_keys.pop_front();
            }
        }

        self.previous_send_counter = self.send_counter;
        self.send_counter = 0;
        self.receive_counter = 0;

        let (root_key, receiving_chain) =
            crypto::kdf_root(&self.root_key, &dh(&self.self_ratchet_secret, &remote));

        let secret = StaticSecret::random_from_rng(OsRng);
        self.self_ratchet_secret = secret.to_bytes();
        self.self_ratchet_public = AgreementPublic::from(&secret).to_bytes();

        let (root_key, sending_chain) =
            crypto::kdf_root(&root_key, &dh(&self.self_ratchet_secret, &remote));

        self.root_key = root_key;
        self.receiving_chain = Some(receiving_chain);
        self.sending_chain = Some(sending_chain);
    }
}

fn dh(secret: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    StaticSecret::from(*secret)
        .diffie_hellman(&AgreementPublic::from(*public))
        .to_bytes()
}
