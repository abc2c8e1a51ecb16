//! Consensus handler: owner of every conversation chain.
//!
//! Each conversation lives behind its own async mutex, so all submits and
//! accepts for one conversation are applied by a single writer while other
//! conversations proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sigil_shared::config::LedgerConfig;
use sigil_shared::{ConversationId, PeerDevice, Transaction, TxHash};
use sigil_store::KeyValueStore;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::chain::{AcceptReport, ConversationChain, SubmitOutcome};
use crate::device::DeviceRecord;
use crate::error::ChainError;
use crate::persist::ChainStore;

pub type ChainHandle = Arc<AsyncMutex<ConversationChain>>;

pub struct ConsensusHandler {
    store: Arc<dyn KeyValueStore>,
    config: LedgerConfig,
    chains: Mutex<HashMap<ConversationId, ChainHandle>>,
}

impl ConsensusHandler {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new, empty conversation with the given participant devices.
    pub fn create_conversation(
        &self,
        id: ConversationId,
        participants: impl IntoIterator<Item = DeviceRecord>,
    ) -> Result<ChainHandle, ChainError> {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        if chains.contains_key(&id) {
            return Err(ChainError::ConversationExists(id));
        }

        let chain = ConversationChain::create(
            id,
            ChainStore::new(self.store.clone(), id),
            self.config.max_pending_per_conversation,
            participants,
        )?;
        let handle = Arc::new(AsyncMutex::new(chain));
        chains.insert(id, handle.clone());

        info!(conversation = %id, "Conversation created");
        Ok(handle)
    }

    /// Handle for an existing conversation, reloading it from the store on
    /// first access.
    pub fn chain(&self, id: ConversationId) -> Result<ChainHandle, ChainError> {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = chains.get(&id) {
            return Ok(handle.clone());
        }

        let chain = ConversationChain::load(
            id,
            ChainStore::new(self.store.clone(), id),
            self.config.max_pending_per_conversation,
        )?
        .ok_or(ChainError::UnknownConversation(id))?;
        let handle = Arc::new(AsyncMutex::new(chain));
        chains.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn submit_local(&self, tx: Transaction) -> Result<SubmitOutcome, ChainError> {
        let handle = self.chain(tx.conversation_id)?;
        let mut chain = handle.lock().await;
        chain.submit_local(tx)
    }

    pub async fn accept_remote(&self, tx: Transaction) -> Result<AcceptReport, ChainError> {
        let handle = self.chain(tx.conversation_id)?;
        let mut chain = handle.lock().await;
        chain.accept_remote(tx)
    }

    pub async fn current_tip(&self, id: ConversationId) -> Result<TxHash, ChainError> {
        let handle = self.chain(id)?;
        let chain = handle.lock().await;
        Ok(chain.tip())
    }

    /// Canonical transactions a device that has seen up to `sequence` is
    /// missing, for catch-up replay.
    pub async fn get_chain_since(
        &self,
        id: ConversationId,
        sequence: u64,
    ) -> Result<Vec<Transaction>, ChainError> {
        let handle = self.chain(id)?;
        let chain = handle.lock().await;
        Ok(chain.transactions_since(sequence))
    }

    pub async fn report_device_seen(
        &self,
        id: ConversationId,
        device: PeerDevice,
        sequence: u64,
    ) -> Result<(), ChainError> {
        let handle = self.chain(id)?;
        let mut chain = handle.lock().await;
        chain.report_device_seen(&device, sequence)
    }

    pub async fn add_participant(
        &self,
        id: ConversationId,
        record: DeviceRecord,
    ) -> Result<(), ChainError> {
        let handle = self.chain(id)?;
        let mut chain = handle.lock().await;
        chain.add_participant(record)
    }
}
