//! Per peer-device session records.
//!
//! Each `(user, device)` key owns one record behind its own async mutex, so
//! ratchet advances for one peer device are serialized while different
//! devices proceed in parallel. Records are loaded lazily from the sealed
//! store and written back by the caller while it still holds the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sigil_shared::{PeerDevice, PublicIdentity};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::SessionError;
use crate::ratchet::RatchetState;
use crate::sealed::SealedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Explicit local reset
    Reset,
    /// The peer device presented a different identity key
    IdentityChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    /// Key agreement done, no message exchanged yet
    Established(Box<RatchetState>),
    Ratcheting(Box<RatchetState>),
    Terminated(TerminationReason),
}

/// Phase of a session without its key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Established,
    Ratcheting,
    Terminated(TerminationReason),
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Uninitialized => SessionPhase::Uninitialized,
            SessionState::Established(_) => SessionPhase::Established,
            SessionState::Ratcheting(_) => SessionPhase::Ratcheting,
            SessionState::Terminated(reason) => SessionPhase::Terminated(*reason),
        }
    }

    pub fn ratchet(&self) -> Option<&RatchetState> {
        match self {
            SessionState::Established(state) | SessionState::Ratcheting(state) => Some(state.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub peer: PeerDevice,
    pub state: SessionState,
    /// Last identity seen for this device; survives termination so a later
    /// key change can still be detected.
    pub remote_identity: Option<PublicIdentity>,
}

impl SessionRecord {
    fn new(peer: PeerDevice) -> Self {
        Self {
            peer,
            state: SessionState::Uninitialized,
            remote_identity: None,
        }
    }
}

pub type SessionHandle = Arc<AsyncMutex<SessionRecord>>;

pub struct SessionStore {
    records: Mutex<HashMap<PeerDevice, SessionHandle>>,
    sealed: SealedStore,
}

impl SessionStore {
    pub fn new(sealed: SealedStore) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            sealed,
        }
    }

    fn storage_key(peer: &PeerDevice) -> String {
        format!("session:{}", peer.storage_key())
    }

    /// Handle for `peer`, loading the persisted record on first access.
    pub fn handle(&self, peer: PeerDevice) -> Result<SessionHandle, SessionError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = records.get(&peer) {
            return Ok(handle.clone());
        }

        let record = self
            .sealed
            .get::<SessionRecord>(&Self::storage_key(&peer))?
            .unwrap_or_else(|| SessionRecord::new(peer));
        let handle = Arc::new(AsyncMutex::new(record));
        records.insert(peer, handle.clone());
        Ok(handle)
    }

    /// Write a record back. Call while holding its lock.
    pub fn persist(&self, record: &SessionRecord) -> Result<(), SessionError> {
        self.sealed.put(&Self::storage_key(&record.peer), record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_shared::{DeviceId, UserId};
    use sigil_store::{KeyValueStore, MemoryStore};

    #[tokio::test]
    async fn records_reload_from_store() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let peer = PeerDevice::new(UserId([4u8; 32]), DeviceId(1));

        {
            let store = SessionStore::new(SealedStore::new(backend.clone(), [1u8; 32]));
            let handle = store.handle(peer).unwrap();
            let mut record = handle.lock().await;
            record.state = SessionState::Terminated(TerminationReason::Reset);
            store.persist(&record).unwrap();
        }

        let store = SessionStore::new(SealedStore::new(backend, [1u8; 32]));
        let handle = store.handle(peer).unwrap();
        let record = handle.lock().await;
        assert_eq!(
            record.state.phase(),
            SessionPhase::Terminated(TerminationReason::Reset)
        );
    }

    #[tokio::test]
    async fn same_peer_shares_one_handle() {
        let store = SessionStore::new(SealedStore::new(Arc::new(MemoryStore::new()), [1u8; 32]));
        let peer = PeerDevice::new(UserId([4u8; 32]), DeviceId(1));
        let a = store.handle(peer).unwrap();
        let b = store.handle(peer).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = store
            .handle(PeerDevice::new(UserId([4u8; 32]), DeviceId(2)))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(a.lock().await.state.phase(), SessionPhase::Uninitialized);
    }
}
