//! Extended triple Diffie-Hellman key agreement.
//!
//! The initiator combines its identity key and a fresh ephemeral key with
//! the responder's identity, signed pre-key and (optionally) one-time
//! pre-key. Both sides feed the same DH outputs, in the same order, into a
//! BLAKE3 derivation so they arrive at one shared secret without ever
//! exchanging it.

use rand::rngs::OsRng;
use sigil_shared::constants::KDF_CONTEXT_X3DH;
use sigil_shared::crypto::{derive_key, SymmetricKey};
use sigil_shared::protocol::PreKeyHeader;
use sigil_shared::{IdentityKeyPair, PublicIdentity};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use crate::error::KeyStoreError;
use crate::key_store::PreKeyBundle;

/// Result of a completed agreement on either side.
pub struct AgreementOutput {
    pub shared_secret: SymmetricKey,
    /// Initiator identity followed by responder identity; bound into every
    /// message of the session as AEAD associated data.
    pub associated_data: Vec<u8>,
}

/// Initiator half. Verifies the bundle, picks its first one-time pre-key if
/// it offers any and returns the header the responder needs.
pub fn initiate(
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(AgreementOutput, PreKeyHeader), KeyStoreError> {
    bundle.verify()?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = AgreementPublic::from(&ephemeral).to_bytes();
    let one_time = bundle.one_time_prekeys.first().copied();

    let dh1 = identity.agree(&bundle.signed_prekey.public);
    let dh2 = dh(&ephemeral, &bundle.identity.agreement);
    let dh3 = dh(&ephemeral, &bundle.signed_prekey.public);
    let dh4 = one_time.map(|otk| dh(&ephemeral, &otk.public));

    let local = identity.public();
    let output = AgreementOutput {
        shared_secret: combine(&dh1, &dh2, &dh3, dh4.as_ref()),
        associated_data: associated_data(&local, &bundle.identity),
    };
    let header = PreKeyHeader {
        identity: local,
        ephemeral: ephemeral_public,
        signed_prekey_id: bundle.signed_prekey.id,
        one_time_prekey_id: one_time.map(|otk| otk.id),
    };
    Ok((output, header))
}

/// Responder half, run on receipt of a message carrying `header`.
pub fn respond(
    identity: &IdentityKeyPair,
    header: &PreKeyHeader,
    signed_prekey: &StaticSecret,
    one_time_prekey: Option<&StaticSecret>,
) -> AgreementOutput {
    let dh1 = dh(signed_prekey, &header.identity.agreement);
    let dh2 = identity.agree(&header.ephemeral);
    let dh3 = dh(signed_prekey, &header.ephemeral);
    let dh4 = one_time_prekey.map(|otk| dh(otk, &header.ephemeral));

    AgreementOutput {
        shared_secret: combine(&dh1, &dh2, &dh3, dh4.as_ref()),
        associated_data: associated_data(&header.identity, &identity.public()),
    }
}

fn dh(secret: &StaticSecret, public: &[u8; 32]) -> [u8; 32] {
    secret
        .diffie_hellman(&AgreementPublic::from(*public))
        .to_bytes()
}

fn combine(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> SymmetricKey {
    let padding = [0xFFu8; 32];
    let mut parts: Vec<&[u8]> = vec![&padding[..], &dh1[..], &dh2[..], &dh3[..]];
    if let Some(dh4) = dh4 {
        parts.push(&dh4[..]);
    }
    derive_key(KDF_CONTEXT_X3DH, &parts)
}

fn associated_data(initiator: &PublicIdentity, responder: &PublicIdentity) -> Vec<u8> {
    let mut ad = Vec::with_capacity(128);
    ad.extend_from_slice(&initiator.signing);
    ad.extend_from_slice(&initiator.agreement);
    ad.extend_from_slice(&responder.signing);
    ad.extend_from_slice(&responder.agreement);
    ad
}
