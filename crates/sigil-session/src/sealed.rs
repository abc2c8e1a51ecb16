//! Private material at rest.
//!
//! Records are bincode-encoded and then sealed with XChaCha20-Poly1305 under
//! a storage key before they reach the persistence backend.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sigil_shared::crypto::{self, SymmetricKey};
use sigil_store::{KeyValueStore, StoreError};

use crate::error::KeyStoreError;

#[derive(Clone)]
pub struct SealedStore {
    inner: Arc<dyn KeyValueStore>,
    key: SymmetricKey,
}

impl SealedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, key: SymmetricKey) -> Self {
        Self { inner, key }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KeyStoreError> {
        let plain = bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        let sealed = crypto::encrypt(&self.key, &plain)?;
        self.inner.put(key, &sealed)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KeyStoreError> {
        let Some(sealed) = self.inner.get(key)? else {
            return Ok(None);
        };
        let plain = crypto::decrypt(&self.key, &sealed)?;
        let value = bincode::deserialize(&plain).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(Some(value))
    }

    pub fn delete(&self, key: &str) -> Result<bool, KeyStoreError> {
        Ok(self.inner.delete(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_store::MemoryStore;

    #[test]
    fn sealed_values_are_opaque_and_key_bound() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let sealed = SealedStore::new(backend.clone(), [1u8; 32]);
        sealed.put("secret", &[42u8; 32]).unwrap();

        let raw = backend.get("secret").unwrap().unwrap();
        assert!(!raw.windows(32).any(|w| w == [42u8; 32]));
        assert_eq!(sealed.get::<[u8; 32]>("secret").unwrap(), Some([42u8; 32]));

        let wrong = SealedStore::new(backend, [2u8; 32]);
        assert!(matches!(
            wrong.get::<[u8; 32]>("secret"),
            Err(KeyStoreError::Sealed(_))
        ));
    }
}
