use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::IdentityError;

/// A device's long-term identity: an Ed25519 key for signing transactions
/// and pre-keys, plus an X25519 key for session key agreement.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    agreement_key: StaticSecret,
}

/// The publishable half of an [`IdentityKeyPair`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PublicIdentity {
    pub signing: [u8; 32],
    pub agreement: [u8; 32],
}

/// Serializable format for storing identity material at rest
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityExport {
    pub signing_secret: [u8; 32],
    pub agreement_secret: [u8; 32],
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            agreement_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore identity from a serialized export
    pub fn from_export(export: &IdentityExport) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&export.signing_secret),
            agreement_key: StaticSecret::from(export.agreement_secret),
        }
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            signing_secret: self.signing_key.to_bytes(),
            agreement_secret: self.agreement_key.to_bytes(),
        }
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            signing: self.signing_key.verifying_key().to_bytes(),
            agreement: AgreementPublic::from(&self.agreement_key).to_bytes(),
        }
    }

    /// Get the raw Ed25519 public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 agreement with a peer public key.
    pub fn agree(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        self.agreement_key
            .diffie_hellman(&AgreementPublic::from(*peer_public))
            .to_bytes()
    }
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::BadSignature)
}
