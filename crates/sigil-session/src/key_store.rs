//! Long-term identity, signed pre-keys and one-time pre-keys.
//!
//! The [`KeyStore`] is the only writer of private key material. All
//! mutations go through a write lock and are persisted (sealed) before the
//! call returns; signing and agreement take the read lock so they never
//! observe a half-finished rotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sigil_shared::crypto::SymmetricKey;
use sigil_shared::identity::{verify_signature, IdentityExport};
use sigil_shared::{IdentityKeyPair, PublicIdentity};
use sigil_store::KeyValueStore;
use tokio::sync::RwLock;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use crate::error::KeyStoreError;
use crate::sealed::SealedStore;

const MATERIAL_KEY: &str = "keys:material";

/// Public half of a signed pre-key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
    /// Ed25519 signature by the identity key over `public`
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// Everything a peer needs to start a session with this device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub identity: PublicIdentity,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed pre-key signature against the bundle's identity.
    pub fn verify(&self) -> Result<(), KeyStoreError> {
        let signature = Signature::from_slice(&self.signed_prekey.signature)
            .map_err(|_| KeyStoreError::InvalidSignedPreKey)?;
        verify_signature(
            &self.identity.signing,
            &self.signed_prekey.public,
            &signature,
        )
        .map_err(|_| KeyStoreError::InvalidSignedPreKey)
    }

    /// Encode the bundle as a base64url string (copiable code).
    pub fn encode(&self) -> Result<String, KeyStoreError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let bytes =
            bincode::serialize(self).map_err(|e| KeyStoreError::InvalidBundle(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode a base64url string back into a bundle.
    pub fn decode(code: &str) -> Result<Self, KeyStoreError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let bytes = URL_SAFE_NO_PAD
            .decode(code.trim())
            .map_err(|e| KeyStoreError::InvalidBundle(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| KeyStoreError::InvalidBundle(e.to_string()))
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SignedPreKeyRecord {
    id: u32,
    secret: [u8; 32],
    public: [u8; 32],
    signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    fn generate(identity: &IdentityKeyPair, id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = AgreementPublic::from(&secret).to_bytes();
        let signature = identity.sign(&public).to_bytes().to_vec();
        Self {
            id,
            secret: secret.to_bytes(),
            public,
            signature,
        }
    }

    fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public: self.public,
            signature: self.signature.clone(),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct StoredMaterial {
    identity: Option<IdentityExport>,
    signed_prekey: Option<SignedPreKeyRecord>,
    previous_signed_prekey: Option<SignedPreKeyRecord>,
    one_time_prekeys: BTreeMap<u32, [u8; 32]>,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
}

struct KeyMaterial {
    identity: Option<IdentityKeyPair>,
    signed_prekey: Option<SignedPreKeyRecord>,
    previous_signed_prekey: Option<SignedPreKeyRecord>,
    one_time_prekeys: BTreeMap<u32, [u8; 32]>,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
}

impl KeyMaterial {
    fn from_stored(stored: StoredMaterial) -> Self {
        Self {
            identity: stored.identity.as_ref().map(IdentityKeyPair::from_export),
            signed_prekey: stored.signed_prekey.clone(),
            previous_signed_prekey: stored.previous_signed_prekey.clone(),
            one_time_prekeys: stored.one_time_prekeys.clone(),
            next_signed_prekey_id: stored.next_signed_prekey_id,
            next_one_time_prekey_id: stored.next_one_time_prekey_id,
        }
    }

    fn to_stored(&self) -> StoredMaterial {
        StoredMaterial {
            identity: self.identity.as_ref().map(IdentityKeyPair::to_export),
            signed_prekey: self.signed_prekey.clone(),
            previous_signed_prekey: self.previous_signed_prekey.clone(),
            one_time_prekeys: self.one_time_prekeys.clone(),
            next_signed_prekey_id: self.next_signed_prekey_id,
            next_one_time_prekey_id: self.next_one_time_prekey_id,
        }
    }

    fn identity(&self) -> Result<&IdentityKeyPair, KeyStoreError> {
        self.identity.as_ref().ok_or(KeyStoreError::NoIdentity)
    }
}

pub struct KeyStore {
    material: RwLock<KeyMaterial>,
    sealed: SealedStore,
}

impl KeyStore {
    /// Open the key store backed by `store`, restoring any persisted
    /// material sealed under `storage_key`.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        storage_key: SymmetricKey,
    ) -> Result<Self, KeyStoreError> {
        let sealed = SealedStore::new(store, storage_key);
        let stored: StoredMaterial = sealed.get(MATERIAL_KEY)?.unwrap_or_default();
        let material = KeyMaterial::from_stored(stored);

        debug!(
            has_identity = material.identity.is_some(),
            one_time_prekeys = material.one_time_prekeys.len(),
            "Key store opened"
        );

        Ok(Self {
            material: RwLock::new(material),
            sealed,
        })
    }

    fn persist(&self, material: &KeyMaterial) -> Result<(), KeyStoreError> {
        self.sealed.put(MATERIAL_KEY, &material.to_stored())
    }

    /// Create the device identity. Fails if one already exists.
    pub async fn generate_identity(&self) -> Result<PublicIdentity, KeyStoreError> {
        let mut material = self.material.write().await;
        if material.identity.is_some() {
            return Err(KeyStoreError::IdentityExists);
        }

        let identity = IdentityKeyPair::generate();
        let public = identity.public();
        material.identity = Some(identity);
        self.persist(&material)?;

        info!(identity = %hex_short(&public.signing), "Generated device identity");
        Ok(public)
    }

    pub async fn public_identity(&self) -> Result<PublicIdentity, KeyStoreError> {
        let material = self.material.read().await;
        Ok(material.identity()?.public())
    }

    /// Run `f` with the identity under the read lock.
    pub async fn with_identity<R>(
        &self,
        f: impl FnOnce(&IdentityKeyPair) -> R,
    ) -> Result<R, KeyStoreError> {
        let material = self.material.read().await;
        Ok(f(material.identity()?))
    }

    /// Publish a bundle with `one_time_count` freshly generated one-time
    /// pre-keys. A signed pre-key is created on first use.
    pub async fn generate_prekey_bundle(
        &self,
        one_time_count: usize,
    ) -> Result<PreKeyBundle, KeyStoreError> {
        let mut material = self.material.write().await;
        let identity = material.identity()?.clone();

        if material.signed_prekey.is_none() {
            let id = material.next_signed_prekey_id;
            material.signed_prekey = Some(SignedPreKeyRecord::generate(&identity, id));
            material.next_signed_prekey_id = id.wrapping_add(1);
        }

        let mut one_time_prekeys = Vec::with_capacity(one_time_count);
        for _ in 0..one_time_count {
            let id = material.next_one_time_prekey_id;
            material.next_one_time_prekey_id = id.wrapping_add(1);

            let secret = StaticSecret::random_from_rng(OsRng);
            let public = AgreementPublic::from(&secret).to_bytes();
            material.one_time_prekeys.insert(id, secret.to_bytes());
            one_time_prekeys.push(OneTimePreKeyPublic { id, public });
        }

        self.persist(&material)?;

        let signed_prekey = material
            .signed_prekey
            .as_ref()
            .map(SignedPreKeyRecord::to_public)
            .ok_or(KeyStoreError::NoSignedPreKey)?;

        debug!(
            signed_prekey = signed_prekey.id,
            generated = one_time_count,
            available = material.one_time_prekeys.len(),
            "Generated pre-key bundle"
        );

        Ok(PreKeyBundle {
            identity: identity.public(),
            signed_prekey,
            one_time_prekeys,
        })
    }

    /// Remove and return a one-time pre-key. A consumed id is gone for good:
    /// asking for it again is an error, never a silent retry.
    pub async fn consume_one_time_prekey(&self, id: u32) -> Result<StaticSecret, KeyStoreError> {
        let mut material = self.material.write().await;
        let secret = material
            .one_time_prekeys
            .remove(&id)
            .ok_or(KeyStoreError::NotFound(id))?;
        self.persist(&material)?;

        debug!(prekey = id, "Consumed one-time pre-key");
        Ok(StaticSecret::from(secret))
    }

    /// Look a one-time pre-key up without consuming it, so key agreement can
    /// be authenticated before the key is burned.
    pub(crate) async fn peek_one_time_prekey(&self, id: u32) -> Result<StaticSecret, KeyStoreError> {
        let material = self.material.read().await;
        material
            .one_time_prekeys
            .get(&id)
            .map(|secret| StaticSecret::from(*secret))
            .ok_or(KeyStoreError::NotFound(id))
    }

    /// Replace the signed pre-key. The previous one stays usable for
    /// initiations already in flight; anything older is discarded.
    pub async fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyPublic, KeyStoreError> {
        let mut material = self.material.write().await;
        let identity = material.identity()?.clone();

        let id = material.next_signed_prekey_id;
        let fresh = SignedPreKeyRecord::generate(&identity, id);
        let public = fresh.to_public();
        material.next_signed_prekey_id = id.wrapping_add(1);
        material.previous_signed_prekey = material.signed_prekey.replace(fresh);
        self.persist(&material)?;

        info!(signed_prekey = id, "Rotated signed pre-key");
        Ok(public)
    }

    pub(crate) async fn signed_prekey_secret(&self, id: u32) -> Result<StaticSecret, KeyStoreError> {
        let material = self.material.read().await;
        let result = [&material.signed_prekey, &material.previous_signed_prekey]
            .into_iter()
            .flatten()
            .find(|record| record.id == id)
            .map(|record| StaticSecret::from(record.secret))
            .ok_or(KeyStoreError::UnknownSignedPreKey(id));
        result
    }

    pub async fn one_time_prekey_count(&self) -> usize {
        self.material.read().await.one_time_prekeys.len()
    }
}

fn hex_short(bytes: &[u8; 32]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}
