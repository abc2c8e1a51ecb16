//! One conversation's hash-linked history.
//!
//! Every known transaction is kept. The canonical history is the path from
//! genesis that, at each fork, follows the child with the lowest
//! [`Transaction::ordering_key`]; everything off that path is orphaned but
//! retained. Because the rule only depends on which transactions are known,
//! arrival order never changes the outcome.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use sigil_shared::{ConversationId, PeerDevice, Transaction, TxHash};
use tracing::{debug, info, warn};

use crate::device::DeviceRecord;
use crate::error::{ChainError, RejectReason};
use crate::persist::{ChainMeta, ChainStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// On the canonical path at this 1-based sequence number
    Canonical(u64),
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { hash: TxHash, sequence: u64 },
    Rejected(RejectReason),
}

/// A fork was detected and resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNotice {
    pub conversation: ConversationId,
    /// The transaction that revealed the fork
    pub hash: TxHash,
    /// Last canonical transaction both branches share
    pub ancestor: TxHash,
    /// Whether the incoming transaction became the new tip
    pub adopted: bool,
    /// Previously canonical transactions demoted by the resolution
    pub orphaned: Vec<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted { hash: TxHash, sequence: u64 },
    Conflict(ConflictNotice),
    Rejected(RejectReason),
    /// Already known; nothing changed
    Duplicate,
    /// Parent not known yet; buffered until it arrives
    Deferred,
}

impl AcceptOutcome {
    /// The transaction is now part of canonical history.
    pub fn is_canonical(&self) -> bool {
        matches!(
            self,
            AcceptOutcome::Accepted { .. }
                | AcceptOutcome::Conflict(ConflictNotice { adopted: true, .. })
        )
    }

    fn stored_hash(&self) -> Option<TxHash> {
        match self {
            AcceptOutcome::Accepted { hash, .. } => Some(*hash),
            AcceptOutcome::Conflict(notice) => Some(notice.hash),
            _ => None,
        }
    }
}

/// Result of [`ConversationChain::accept_remote`]: the outcome for the
/// submitted transaction plus every buffered descendant it released.
#[derive(Debug, Clone)]
pub struct AcceptReport {
    pub outcome: AcceptOutcome,
    pub released: Vec<(Transaction, AcceptOutcome)>,
}

pub struct ConversationChain {
    id: ConversationId,
    entries: HashMap<TxHash, Transaction>,
    canonical: Vec<TxHash>,
    positions: HashMap<TxHash, u64>,
    pending: HashMap<TxHash, Vec<Transaction>>,
    pending_hashes: HashSet<TxHash>,
    /// Deferred `(hash, parent)` pairs, oldest first
    pending_order: VecDeque<(TxHash, TxHash)>,
    participants: BTreeMap<PeerDevice, DeviceRecord>,
    max_pending: usize,
    store: ChainStore,
}

impl ConversationChain {
    pub(crate) fn create(
        id: ConversationId,
        store: ChainStore,
        max_pending: usize,
        participants: impl IntoIterator<Item = DeviceRecord>,
    ) -> Result<Self, ChainError> {
        if store.meta()?.is_some() {
            return Err(ChainError::ConversationExists(id));
        }
        store.put_meta(&ChainMeta {
            id,
            created_at: Utc::now(),
        })?;

        let mut chain = Self::empty(id, store, max_pending);
        for record in participants {
            chain.add_participant(record)?;
        }
        Ok(chain)
    }

    /// Reload a chain persisted earlier. `None` when nothing is stored.
    pub(crate) fn load(
        id: ConversationId,
        store: ChainStore,
        max_pending: usize,
    ) -> Result<Option<Self>, ChainError> {
        if store.meta()?.is_none() {
            return Ok(None);
        }
        let loaded = store.load()?;
        let mut chain = Self::empty(id, store, max_pending);

        for tx in loaded.transactions {
            chain.entries.insert(tx.hash(), tx);
        }
        for (index, hash) in loaded.canonical.into_iter().enumerate() {
            if !chain.entries.contains_key(&hash) {
                return Err(ChainError::MissingAncestor(hash));
            }
            chain.positions.insert(hash, index as u64 + 1);
            chain.canonical.push(hash);
        }
        for record in loaded.devices {
            chain.participants.insert(record.device, record);
        }

        debug!(
            conversation = %id,
            canonical = chain.canonical.len(),
            known = chain.entries.len(),
            "Chain loaded"
        );
        Ok(Some(chain))
    }

    fn empty(id: ConversationId, store: ChainStore, max_pending: usize) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            canonical: Vec::new(),
            positions: HashMap::new(),
            pending: HashMap::new(),
            pending_hashes: HashSet::new(),
            pending_order: VecDeque::new(),
            participants: BTreeMap::new(),
            max_pending,
            store,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Hash of the last canonical transaction, or genesis for an empty chain.
    pub fn tip(&self) -> TxHash {
        self.canonical.last().copied().unwrap_or(TxHash::GENESIS)
    }

    /// Number of canonical transactions (the tip's sequence number).
    pub fn len(&self) -> u64 {
        self.canonical.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn status(&self, hash: &TxHash) -> Option<EntryStatus> {
        match self.positions.get(hash) {
            Some(sequence) => Some(EntryStatus::Canonical(*sequence)),
            None if self.entries.contains_key(hash) => Some(EntryStatus::Orphaned),
            None => None,
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<&Transaction> {
        self.entries.get(hash)
    }

    pub fn canonical_hashes(&self) -> &[TxHash] {
        &self.canonical
    }

    /// Canonical transactions after `sequence`, oldest first.
    pub fn transactions_since(&self, sequence: u64) -> Vec<Transaction> {
        self.canonical
            .iter()
            .skip(sequence as usize)
            .filter_map(|hash| self.entries.get(hash))
            .cloned()
            .collect()
    }

    pub fn orphaned(&self) -> Vec<&Transaction> {
        self.entries
            .iter()
            .filter(|(hash, _)| !self.positions.contains_key(*hash))
            .map(|(_, tx)| tx)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_hashes.len()
    }

    pub fn participant(&self, device: &PeerDevice) -> Option<&DeviceRecord> {
        self.participants.get(device)
    }

    pub fn participants(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.participants.values()
    }

    pub fn add_participant(&mut self, record: DeviceRecord) -> Result<(), ChainError> {
        self.store.put_device(&record)?;
        debug!(conversation = %self.id, device = %record.device, "Participant added");
        self.participants.insert(record.device, record);
        Ok(())
    }

    /// A device confirmed it holds canonical history up to `sequence`.
    pub fn report_device_seen(&mut self, device: &PeerDevice, sequence: u64) -> Result<(), ChainError> {
        let len = self.len();
        let record = self
            .participants
            .get_mut(device)
            .ok_or(ChainError::UnknownParticipant(*device))?;
        record.last_seen_sequence = sequence.min(len);
        self.store.put_device(record)?;
        Ok(())
    }

    /// Append a locally built transaction. Only a transaction built on the
    /// current tip is taken; anything else leaves the chain untouched.
    pub fn submit_local(&mut self, tx: Transaction) -> Result<SubmitOutcome, ChainError> {
        if tx.conversation_id != self.id {
            return Ok(SubmitOutcome::Rejected(RejectReason::WrongConversation(
                tx.conversation_id,
            )));
        }
        let tip = self.tip();
        if tx.previous_hash != tip {
            return Ok(SubmitOutcome::Rejected(RejectReason::StaleTip {
                expected: tip,
                actual: tx.previous_hash,
            }));
        }

        let (hash, sequence) = self.append_canonical(tx)?;
        debug!(conversation = %self.id, seq = sequence, tip = %hash.short(), "Local transaction accepted");
        Ok(SubmitOutcome::Accepted { hash, sequence })
    }

    /// Validate and place a transaction received from another device, then
    /// release any buffered descendants it unblocks.
    pub fn accept_remote(&mut self, tx: Transaction) -> Result<AcceptReport, ChainError> {
        let outcome = self.accept_one(tx)?;

        let mut released = Vec::new();
        let mut queue: VecDeque<TxHash> = outcome.stored_hash().into_iter().collect();
        while let Some(parent) = queue.pop_front() {
            let Some(mut children) = self.pending.remove(&parent) else {
                continue;
            };
            self.pending_order.retain(|(_, waiting_on)| *waiting_on != parent);
            children.sort_by(|a, b| a.cmp_priority(b));
            for child in children {
                self.pending_hashes.remove(&child.hash());
                let child_outcome = self.accept_one(child.clone())?;
                queue.extend(child_outcome.stored_hash());
                released.push((child, child_outcome));
            }
        }

        if !released.is_empty() {
            debug!(conversation = %self.id, released = released.len(), "Released buffered transactions");
        }
        Ok(AcceptReport { outcome, released })
    }

    fn accept_one(&mut self, tx: Transaction) -> Result<AcceptOutcome, ChainError> {
        if tx.conversation_id != self.id {
            return Ok(AcceptOutcome::Rejected(RejectReason::WrongConversation(
                tx.conversation_id,
            )));
        }

        let hash = tx.hash();
        if self.entries.contains_key(&hash) || self.pending_hashes.contains(&hash) {
            return Ok(AcceptOutcome::Duplicate);
        }

        let sender = tx.sender();
        let Some(record) = self.participants.get(&sender) else {
            warn!(conversation = %self.id, sender = %sender, "Transaction from unknown device");
            return Ok(AcceptOutcome::Rejected(RejectReason::UnknownDevice(sender)));
        };
        if tx.verify(&record.public_key).is_err() {
            warn!(conversation = %self.id, sender = %sender, tx = %hash.short(), "Invalid transaction signature");
            return Ok(AcceptOutcome::Rejected(RejectReason::SignatureInvalid));
        }

        if tx.previous_hash == self.tip() {
            let (hash, sequence) = self.append_canonical(tx)?;
            debug!(conversation = %self.id, seq = sequence, tip = %hash.short(), "Remote transaction accepted");
            return Ok(AcceptOutcome::Accepted { hash, sequence });
        }

        if !tx.previous_hash.is_genesis() && !self.entries.contains_key(&tx.previous_hash) {
            return Ok(self.defer(tx, hash));
        }

        self.resolve_fork(tx, hash)
    }

    fn defer(&mut self, tx: Transaction, hash: TxHash) -> AcceptOutcome {
        if self.max_pending == 0 {
            warn!(conversation = %self.id, tx = %hash.short(), "Out-of-order buffer disabled");
            return AcceptOutcome::Rejected(RejectReason::PendingBufferFull);
        }
        while self.pending_hashes.len() >= self.max_pending {
            self.evict_oldest_pending();
        }
        debug!(
            conversation = %self.id,
            tx = %hash.short(),
            parent = %tx.previous_hash.short(),
            "Parent unknown, transaction deferred"
        );
        self.pending_hashes.insert(hash);
        self.pending_order.push_back((hash, tx.previous_hash));
        self.pending.entry(tx.previous_hash).or_default().push(tx);
        AcceptOutcome::Deferred
    }

    /// Drop the longest-waiting deferred transaction.
    fn evict_oldest_pending(&mut self) {
        let Some((hash, parent)) = self.pending_order.pop_front() else {
            self.pending_hashes.clear();
            return;
        };
        self.pending_hashes.remove(&hash);
        if let Some(children) = self.pending.get_mut(&parent) {
            children.retain(|tx| tx.hash() != hash);
            if children.is_empty() {
                self.pending.remove(&parent);
            }
        }
        warn!(
            conversation = %self.id,
            tx = %hash.short(),
            parent = %parent.short(),
            "Out-of-order buffer full, oldest deferred transaction dropped"
        );
    }

    fn resolve_fork(&mut self, tx: Transaction, hash: TxHash) -> Result<AcceptOutcome, ChainError> {
        let parent = tx.previous_hash;

        let Some(fork_point) = self.sequence_of(&parent) else {
            // Parent is itself off the canonical path: the new transaction
            // extends a losing branch.
            let ancestor = self.canonical_ancestor(parent)?;
            self.store.put_transaction(&tx)?;
            self.entries.insert(hash, tx);

            info!(conversation = %self.id, tx = %hash.short(), "Transaction extends an orphaned branch");
            return Ok(AcceptOutcome::Conflict(ConflictNotice {
                conversation: self.id,
                hash,
                ancestor,
                adopted: false,
                orphaned: Vec::new(),
            }));
        };

        let competitor_hash = self.canonical[fork_point as usize];
        let competitor = self
            .entries
            .get(&competitor_hash)
            .ok_or(ChainError::MissingAncestor(competitor_hash))?;
        let wins = tx.cmp_priority(competitor) == Ordering::Less;

        if !wins {
            self.store.put_transaction(&tx)?;
            self.entries.insert(hash, tx);

            info!(
                conversation = %self.id,
                tx = %hash.short(),
                canonical = %competitor_hash.short(),
                "Fork resolved in favour of the existing branch"
            );
            return Ok(AcceptOutcome::Conflict(ConflictNotice {
                conversation: self.id,
                hash,
                ancestor: parent,
                adopted: false,
                orphaned: Vec::new(),
            }));
        }

        let orphaned = self.reorganize(fork_point, tx, hash)?;
        Ok(AcceptOutcome::Conflict(ConflictNotice {
            conversation: self.id,
            hash,
            ancestor: parent,
            adopted: true,
            orphaned,
        }))
    }

    /// Replace the canonical suffix after `fork_point` with `tx`.
    fn reorganize(
        &mut self,
        fork_point: u64,
        tx: Transaction,
        hash: TxHash,
    ) -> Result<Vec<TxHash>, ChainError> {
        let old_len = self.len();
        let sequence = fork_point + 1;
        let sender = tx.sender();

        self.store.put_transaction(&tx)?;
        self.store.truncate_canonical(sequence, old_len)?;
        self.store.put_canonical(sequence, &hash)?;

        let orphaned = self.canonical.split_off(fork_point as usize);
        for displaced in &orphaned {
            self.positions.remove(displaced);
        }
        self.entries.insert(hash, tx);
        self.canonical.push(hash);
        self.positions.insert(hash, sequence);

        for record in self.participants.values_mut() {
            if record.last_seen_sequence > fork_point {
                record.last_seen_sequence = fork_point;
                self.store.put_device(record)?;
            }
        }
        self.note_seen(&sender, sequence)?;

        warn!(
            conversation = %self.id,
            fork_point,
            orphaned = orphaned.len(),
            tip = %hash.short(),
            "Chain reorganised"
        );
        Ok(orphaned)
    }

    fn append_canonical(&mut self, tx: Transaction) -> Result<(TxHash, u64), ChainError> {
        let hash = tx.hash();
        let sequence = self.len() + 1;
        let sender = tx.sender();

        self.store.put_transaction(&tx)?;
        self.store.put_canonical(sequence, &hash)?;

        self.entries.insert(hash, tx);
        self.canonical.push(hash);
        self.positions.insert(hash, sequence);
        self.note_seen(&sender, sequence)?;
        Ok((hash, sequence))
    }

    /// A device that authored the entry at `sequence` has seen everything
    /// up to it.
    fn note_seen(&mut self, device: &PeerDevice, sequence: u64) -> Result<(), ChainError> {
        if let Some(record) = self.participants.get_mut(device) {
            if record.last_seen_sequence < sequence {
                record.last_seen_sequence = sequence;
                self.store.put_device(record)?;
            }
        }
        Ok(())
    }

    fn sequence_of(&self, hash: &TxHash) -> Option<u64> {
        if hash.is_genesis() {
            Some(0)
        } else {
            self.positions.get(hash).copied()
        }
    }

    /// Walk parents from `start` until the canonical path is reached.
    fn canonical_ancestor(&self, start: TxHash) -> Result<TxHash, ChainError> {
        let mut cursor = start;
        loop {
            if self.sequence_of(&cursor).is_some() {
                return Ok(cursor);
            }
            let tx = self
                .entries
                .get(&cursor)
                .ok_or(ChainError::MissingAncestor(cursor))?;
            cursor = tx.previous_hash;
        }
    }
}
