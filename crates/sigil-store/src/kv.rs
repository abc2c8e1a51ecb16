//! The key/value contract every backend implements.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// Minimal storage contract required by the core.
///
/// Keys are `:`-separated ASCII paths such as
/// `chain:<conversation>:tx:<hash>`; [`KeyValueStore::scan_prefix`] returns
/// matching entries in ascending key order.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns `true` if a value was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

impl dyn KeyValueStore {
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.put(key, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec(e.to_string())))
            .transpose()
    }

    pub fn put_bincode<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.put(key, &bytes)
    }

    pub fn get_bincode<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(|bytes| bincode::deserialize(&bytes).map_err(|e| StoreError::Codec(e.to_string())))
            .transpose()
    }

    /// Delete every key under `prefix`; returns how many were removed.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for (key, _) in self.scan_prefix(prefix)? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
