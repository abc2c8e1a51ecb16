//! Storage layout of one conversation chain.
//!
//! ```text
//! chain:<conversation>:meta                 json  ChainMeta
//! chain:<conversation>:tx:<hash>            bincode Transaction (canonical and orphaned)
//! chain:<conversation>:seq:<020 sequence>   raw 32-byte hash of the canonical entry
//! chain:<conversation>:device:<user>:<dev>  json  DeviceRecord
//! ```
//!
//! Canonical order is recovered from the zero-padded sequence keys, so a
//! prefix scan returns it already sorted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sigil_shared::{ConversationId, Transaction, TxHash};
use sigil_store::{KeyValueStore, StoreError};

use crate::device::DeviceRecord;
use crate::error::ChainError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChainMeta {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
}

pub(crate) struct LoadedChain {
    pub transactions: Vec<Transaction>,
    pub canonical: Vec<TxHash>,
    pub devices: Vec<DeviceRecord>,
}

#[derive(Clone)]
pub(crate) struct ChainStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ChainStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, conversation: ConversationId) -> Self {
        Self {
            kv,
            prefix: format!("chain:{conversation}:"),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub fn meta(&self) -> Result<Option<ChainMeta>, ChainError> {
        Ok(self.kv.get_json(&self.key("meta"))?)
    }

    pub fn put_meta(&self, meta: &ChainMeta) -> Result<(), ChainError> {
        Ok(self.kv.put_json(&self.key("meta"), meta)?)
    }

    pub fn put_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        let key = self.key(&format!("tx:{}", tx.hash().to_hex()));
        Ok(self.kv.put_bincode(&key, tx)?)
    }

    /// Record `hash` at 1-based canonical position `sequence`.
    pub fn put_canonical(&self, sequence: u64, hash: &TxHash) -> Result<(), ChainError> {
        let key = self.key(&format!("seq:{sequence:020}"));
        Ok(self.kv.put(&key, &hash.0)?)
    }

    /// Drop canonical positions `from..=to`.
    pub fn truncate_canonical(&self, from: u64, to: u64) -> Result<(), ChainError> {
        for sequence in from..=to {
            self.kv.delete(&self.key(&format!("seq:{sequence:020}")))?;
        }
        Ok(())
    }

    pub fn put_device(&self, record: &DeviceRecord) -> Result<(), ChainError> {
        let key = self.key(&format!("device:{}", record.device.storage_key()));
        Ok(self.kv.put_json(&key, record)?)
    }

    pub fn load(&self) -> Result<LoadedChain, ChainError> {
        let transactions = self
            .kv
            .scan_prefix(&self.key("tx:"))?
            .into_iter()
            .map(|(_, bytes)| {
                Transaction::from_bytes(&bytes).map_err(|e| StoreError::Codec(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let canonical = self
            .kv
            .scan_prefix(&self.key("seq:"))?
            .into_iter()
            .map(|(key, bytes)| {
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map(TxHash)
                    .map_err(|_| StoreError::Codec(format!("bad canonical entry at {key}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let devices = self
            .kv
            .scan_prefix(&self.key("device:"))?
            .into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice::<DeviceRecord>(&bytes)
                    .map_err(|e| StoreError::Codec(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LoadedChain {
            transactions,
            canonical,
            devices,
        })
    }
}
