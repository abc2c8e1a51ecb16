use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{
    CHAIN_STEP_MESSAGE_KEY, CHAIN_STEP_NEXT_CHAIN, KDF_CONTEXT_MESSAGE_NONCE,
    KDF_CONTEXT_ROOT_RATCHET, NONCE_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub type Nonce = [u8; NONCE_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = generate_nonce();
    let ciphertext = seal(key, &nonce_bytes, &[], plaintext)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);
    open(key, &nonce, &[], ciphertext)
}

/// AEAD-encrypt with an explicit nonce and associated data.
///
/// The caller guarantees the (key, nonce) pair is never reused.
pub fn seal(
    key: &SymmetricKey,
    nonce: &Nonce,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn open(
    key: &SymmetricKey,
    nonce: &Nonce,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation over concatenated inputs
pub fn derive_key(context: &str, parts: &[&[u8]]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Root-key ratchet step: mixes a fresh DH output into the root key and
/// yields `(next_root_key, chain_key)`.
pub fn kdf_root(root_key: &SymmetricKey, dh_output: &[u8; 32]) -> (SymmetricKey, SymmetricKey) {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOT_RATCHET);
    hasher.update(root_key);
    hasher.update(dh_output);
    let mut okm = [0u8; 64];
    hasher.finalize_xof().fill(&mut okm);

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (next_root, chain)
}

/// Symmetric chain step: yields `(message_key, next_chain_key)`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let message_key = *blake3::keyed_hash(chain_key, &[CHAIN_STEP_MESSAGE_KEY]).as_bytes();
    let next_chain = *blake3::keyed_hash(chain_key, &[CHAIN_STEP_NEXT_CHAIN]).as_bytes();
    (message_key, next_chain)
}

/// Nonce bound to a single message key, so ratchet encryption stays
/// deterministic for a given chain state.
pub fn message_nonce(message_key: &SymmetricKey) -> Nonce {
    let full = derive_key(KDF_CONTEXT_MESSAGE_NONCE, &[message_key]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&full[..NONCE_SIZE]);
    nonce
}
