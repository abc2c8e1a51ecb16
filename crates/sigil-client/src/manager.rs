//! Ledger Manager: the single write path into conversation history.
//!
//! Outgoing: encrypt for every recipient device, sign on the current tip,
//! submit to the local chain, then hand the transaction to the transport and
//! queue whatever could not be delivered right away.
//!
//! Incoming: let the consensus handler place the transaction first, and only
//! open it once it is part of canonical history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::join_all;
use sigil_ledger::{AcceptOutcome, ChainError, ConsensusHandler, EntryStatus, SubmitOutcome};
use sigil_net::{
    DeliveryEvent, DeliveryQueue, DeliveryStatus, TargetStatus, Transport, TransportError,
};
use sigil_session::{EncryptionEngine, KeyStore, PreKeyBundle, SealedStore, SessionError};
use sigil_shared::config::SigilConfig;
use sigil_shared::crypto::SymmetricKey;
use sigil_shared::protocol::{
    CallSignal, RatchetMessage, RecipientCiphertext, SealedPayload, SenderKeyDistribution,
};
use sigil_shared::{
    Clock, ConversationId, GroupId, MessageId, PayloadKind, PeerDevice, Transaction,
    TransactionSigner, TxHash,
};
use sigil_store::KeyValueStore;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::conversation::{Conversation, ConversationKind, Participant, SentRecord};
use crate::error::ClientError;
use crate::message::{Content, DecryptedMessage, IncomingOutcome, IncomingReport, TransmissionHandle};

const CONVERSATION_PREFIX: &str = "conversation:";

/// Everything a device needs to open its Ledger Manager.
pub struct ManagerOptions {
    pub local: PeerDevice,
    pub store: Arc<dyn KeyValueStore>,
    /// Seals key material and sessions at rest
    pub storage_key: SymmetricKey,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub config: SigilConfig,
}

/// Sender-key distributions included in an outgoing group payload.
struct Distributed {
    group: GroupId,
    key_id: u32,
    members: Vec<PeerDevice>,
}

pub struct LedgerManager {
    local: PeerDevice,
    store: Arc<dyn KeyValueStore>,
    engine: EncryptionEngine,
    consensus: ConsensusHandler,
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn Transport>,
    signer: TransactionSigner,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    /// Subscribed at open so abandonments before the first
    /// [`LedgerManager::run_delivery`] are not missed
    delivery_events: tokio::sync::Mutex<broadcast::Receiver<DeliveryEvent>>,
    /// Serializes read-modify-write of [`SentRecord`]s
    sent_lock: Mutex<()>,
}

impl LedgerManager {
    pub fn open(options: ManagerOptions) -> Result<Self, ClientError> {
        let ManagerOptions {
            local,
            store,
            storage_key,
            transport,
            clock,
            config,
        } = options;

        let keys = Arc::new(KeyStore::open(store.clone(), storage_key)?);
        let engine = EncryptionEngine::new(
            local,
            keys,
            SealedStore::new(store.clone(), storage_key),
            config.session.clone(),
        );
        let consensus = ConsensusHandler::new(store.clone(), config.ledger.clone());
        let queue = Arc::new(DeliveryQueue::open(
            store.clone(),
            config.delivery.clone(),
            clock.clone(),
        )?);
        let delivery_events = tokio::sync::Mutex::new(queue.subscribe());

        let mut conversations = HashMap::new();
        for (key, bytes) in store.scan_prefix(CONVERSATION_PREFIX)? {
            let conversation: Conversation = serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::Codec(format!("{key}: {e}")))?;
            conversations.insert(conversation.id, conversation);
        }
        info!(device = %local, conversations = conversations.len(), "Ledger manager opened");

        Ok(Self {
            local,
            store,
            engine,
            consensus,
            queue,
            transport,
            signer: TransactionSigner::new(local, clock.clone()),
            clock,
            send_timeout: config.delivery.send_timeout,
            conversations: RwLock::new(conversations),
            delivery_events,
            sent_lock: Mutex::new(()),
        })
    }

    pub fn local(&self) -> PeerDevice {
        self.local
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        self.engine.key_store()
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    pub fn consensus(&self) -> &ConsensusHandler {
        &self.consensus
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// This device as a conversation participant.
    pub async fn participant(&self) -> Result<Participant, ClientError> {
        let identity = self.key_store().public_identity().await?;
        Ok(Participant::new(self.local, identity))
    }

    /// Run key agreement with `peer` so messages can be sealed for it.
    pub async fn establish_session(
        &self,
        peer: PeerDevice,
        bundle: &PreKeyBundle,
    ) -> Result<(), ClientError> {
        self.engine.establish_outbound(peer, bundle).await?;
        Ok(())
    }

    /// Start a conversation. The local device is added to `participants`
    /// if missing.
    pub async fn register_conversation(
        &self,
        id: ConversationId,
        kind: ConversationKind,
        mut participants: Vec<Participant>,
    ) -> Result<(), ClientError> {
        if self.read_conversations().contains_key(&id) {
            return Err(ClientError::ConversationExists(id));
        }
        if !participants.iter().any(|p| p.device == self.local) {
            participants.push(self.participant().await?);
        }

        self.consensus
            .create_conversation(id, participants.iter().map(Participant::device_record))
            .map_err(|e| match e {
                ChainError::ConversationExists(id) => ClientError::ConversationExists(id),
                other => other.into(),
            })?;

        let conversation = Conversation {
            id,
            kind,
            participants,
        };
        self.store
            .put_json(&Conversation::storage_key(&id), &conversation)?;
        info!(
            conversation = %id,
            kind = ?kind,
            participants = conversation.participants.len(),
            "Conversation registered"
        );
        self.write_conversations().insert(id, conversation);
        Ok(())
    }

    /// Admit another device. Group sender keys rotate on the next send.
    pub async fn add_participant(
        &self,
        id: ConversationId,
        participant: Participant,
    ) -> Result<(), ClientError> {
        let mut conversation = self.conversation(id)?;
        if conversation.participant(&participant.device).is_some() {
            return Ok(());
        }

        self.consensus
            .add_participant(id, participant.device_record())
            .await?;
        conversation.participants.push(participant);
        self.store
            .put_json(&Conversation::storage_key(&id), &conversation)?;
        self.write_conversations().insert(id, conversation);

        info!(conversation = %id, device = %participant.device, "Participant added");
        Ok(())
    }

    pub fn conversation(&self, id: ConversationId) -> Result<Conversation, ClientError> {
        self.read_conversations()
            .get(&id)
            .cloned()
            .ok_or(ClientError::UnknownConversation(id))
    }

    pub async fn append_outgoing(
        &self,
        id: ConversationId,
        plaintext: &[u8],
    ) -> Result<TransmissionHandle, ClientError> {
        self.append(id, PayloadKind::Message, plaintext).await
    }

    /// Call-setup signaling travels as an ordinary transaction of its own
    /// payload kind.
    pub async fn append_call_signal(
        &self,
        id: ConversationId,
        signal: &CallSignal,
    ) -> Result<TransmissionHandle, ClientError> {
        let bytes = signal.to_bytes()?;
        self.append(id, PayloadKind::CallSignal, &bytes).await
    }

    async fn append(
        &self,
        id: ConversationId,
        kind: PayloadKind,
        plaintext: &[u8],
    ) -> Result<TransmissionHandle, ClientError> {
        let conversation = self.conversation(id)?;
        if conversation.participant(&self.local).is_none() {
            return Err(ClientError::NotAMember(self.local, id));
        }
        let recipients = conversation.recipients(&self.local);
        let (payload, distributed) = self.seal(&conversation, &recipients, plaintext).await?;
        let payload = payload.to_bytes()?;
        let message_id = MessageId::new();

        // Sign and submit under the chain lock so the tip cannot move in
        // between.
        let handle = self.consensus.chain(id)?;
        let (tx, hash, sequence) = {
            let mut chain = handle.lock().await;
            let tip = chain.tip();
            let tx = self
                .key_store()
                .with_identity(|identity| {
                    self.signer
                        .sign_with_id(identity, message_id, id, kind, payload, tip)
                })
                .await??;
            match chain.submit_local(tx.clone())? {
                SubmitOutcome::Accepted { hash, sequence } => (tx, hash, sequence),
                SubmitOutcome::Rejected(reason) => return Err(ClientError::Rejected(reason)),
            }
        };

        if let Some(distributed) = distributed {
            self.engine
                .mark_distributed(distributed.group, distributed.key_id, distributed.members)
                .await?;
        }

        let record = SentRecord {
            message_id,
            conversation: id,
            hash,
            sequence,
            tombstoned_at: None,
            abandoned: Vec::new(),
        };
        self.store
            .put_json(&SentRecord::storage_key(&message_id), &record)?;

        let status = self.transmit(message_id, &tx, &recipients).await?;
        info!(
            conversation = %id,
            seq = sequence,
            tx = %hash.short(),
            recipients = recipients.len(),
            "Outgoing transaction appended"
        );
        Ok(TransmissionHandle::new(message_id, id, hash, sequence, status))
    }

    async fn seal(
        &self,
        conversation: &Conversation,
        recipients: &[PeerDevice],
        plaintext: &[u8],
    ) -> Result<(SealedPayload, Option<Distributed>), ClientError> {
        match conversation.kind {
            ConversationKind::Direct => {
                let mut sealed = Vec::with_capacity(recipients.len());
                for recipient in recipients {
                    let message = self.engine.encrypt(*recipient, plaintext).await?;
                    sealed.push(RecipientCiphertext {
                        recipient: *recipient,
                        message,
                    });
                }
                Ok((SealedPayload::Direct { recipients: sealed }, None))
            }
            ConversationKind::Group(group) => {
                let outbound = self.engine.group_encrypt(group, recipients, plaintext).await?;

                let mut distributions = Vec::with_capacity(outbound.distributions.len());
                let mut members = Vec::with_capacity(outbound.distributions.len());
                for (member, distribution) in &outbound.distributions {
                    let bytes = bincode::serialize(distribution)?;
                    let message = self.engine.encrypt(*member, &bytes).await?;
                    distributions.push(RecipientCiphertext {
                        recipient: *member,
                        message,
                    });
                    members.push(*member);
                }

                let distributed = Distributed {
                    group,
                    key_id: outbound.message.key_id,
                    members,
                };
                Ok((
                    SealedPayload::Group {
                        distributions,
                        message: outbound.message,
                    },
                    Some(distributed),
                ))
            }
        }
    }

    /// Try every recipient once; queue the failures.
    async fn transmit(
        &self,
        message_id: MessageId,
        tx: &Transaction,
        recipients: &[PeerDevice],
    ) -> Result<watch::Receiver<TargetStatus>, ClientError> {
        let attempts = join_all(recipients.iter().map(|target| async move {
            let result = tokio::time::timeout(self.send_timeout, self.transport.send(*target, tx))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            (*target, result)
        }))
        .await;

        let mut initial = TargetStatus::new();
        let mut failed = Vec::new();
        for (target, result) in attempts {
            match result {
                Ok(_) => {
                    initial.insert(target, DeliveryStatus::Delivered);
                }
                Err(e) => {
                    debug!(message = %message_id, target = %target, error = %e, "Immediate send failed, queueing");
                    initial.insert(target, DeliveryStatus::Pending);
                    failed.push((target, e));
                }
            }
        }

        let status = self.queue.track(message_id, initial);
        for (target, error) in failed {
            let queued = self
                .queue
                .enqueue_failed(message_id, target, tx.clone(), Some(error))?;
            if queued == DeliveryStatus::Abandoned {
                self.record_abandoned(message_id, target)?;
            }
        }
        Ok(status)
    }

    /// Withdraw a sent message. Pending and in-flight deliveries are
    /// aborted; the transaction stays in the chain and the message is
    /// marked as a tombstone.
    pub async fn cancel(&self, message_id: MessageId) -> Result<SentRecord, ClientError> {
        let key = SentRecord::storage_key(&message_id);
        let _guard = self.sent_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record: SentRecord = self
            .store
            .get_json(&key)?
            .ok_or(ClientError::UnknownMessage(message_id))?;

        let cancelled = self.queue.cancel(message_id)?;
        if record.tombstoned_at.is_none() {
            record.tombstoned_at = Some(self.clock.now());
            self.store.put_json(&key, &record)?;
        }

        info!(
            message = %message_id,
            conversation = %record.conversation,
            cancelled = cancelled.len(),
            "Message withdrawn, history kept"
        );
        Ok(record)
    }

    pub fn sent_record(&self, message_id: MessageId) -> Result<Option<SentRecord>, ClientError> {
        Ok(self.store.get_json(&SentRecord::storage_key(&message_id))?)
    }

    /// Reattach to a message sent earlier, possibly before a restart.
    /// Targets still queued report their live status; targets already
    /// abandoned report `Abandoned`.
    pub fn transmission(&self, message_id: MessageId) -> Result<Option<TransmissionHandle>, ClientError> {
        let Some(record) = self.sent_record(message_id)? else {
            return Ok(None);
        };
        let initial: TargetStatus = record
            .abandoned
            .iter()
            .map(|device| (*device, DeliveryStatus::Abandoned))
            .collect();
        let status = self.queue.track(message_id, initial);
        Ok(Some(TransmissionHandle::new(
            message_id,
            record.conversation,
            record.hash,
            record.sequence,
            status,
        )))
    }

    /// Persist that `target` will never receive `message_id`.
    fn record_abandoned(&self, message_id: MessageId, target: PeerDevice) -> Result<(), ClientError> {
        let key = SentRecord::storage_key(&message_id);
        let _guard = self.sent_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut record) = self.store.get_json::<SentRecord>(&key)? else {
            warn!(message = %message_id, target = %target, "Abandoned delivery for unknown message");
            return Ok(());
        };
        if record.is_abandoned_for(&target) {
            return Ok(());
        }
        record.abandoned.push(target);
        record.abandoned.sort();
        self.store.put_json(&key, &record)?;
        debug!(message = %message_id, target = %target, "Abandoned target recorded");
        Ok(())
    }

    fn note_delivery_event(&self, event: &DeliveryEvent) {
        if let DeliveryEvent::Abandoned {
            message_id, target, ..
        } = event
        {
            if let Err(e) = self.record_abandoned(*message_id, *target) {
                error!(message = %message_id, target = %target, error = %e, "Failed to record abandoned delivery");
            }
        }
    }

    /// Place a transaction received from another device, then open it and
    /// any buffered transactions it released.
    pub async fn append_incoming(&self, tx: Transaction) -> Result<IncomingReport, ClientError> {
        let conversation = self.conversation(tx.conversation_id)?;
        let report = self.consensus.accept_remote(tx.clone()).await?;

        let outcome = self.open_outcome(&conversation, &tx, report.outcome).await?;
        let mut released = Vec::with_capacity(report.released.len());
        for (child, child_outcome) in report.released {
            released.push(self.open_outcome(&conversation, &child, child_outcome).await?);
        }
        Ok(IncomingReport { outcome, released })
    }

    async fn open_outcome(
        &self,
        conversation: &Conversation,
        tx: &Transaction,
        outcome: AcceptOutcome,
    ) -> Result<IncomingOutcome, ClientError> {
        let opened = match outcome {
            AcceptOutcome::Accepted { hash, sequence } => {
                self.open_message(conversation, tx, hash, sequence).await?
            }
            AcceptOutcome::Conflict(notice) => {
                let message = if notice.adopted {
                    let sequence = self.canonical_sequence(conversation.id, &notice.hash).await?;
                    match self.open_message(conversation, tx, notice.hash, sequence).await? {
                        IncomingOutcome::Delivered(message) => Some(message),
                        _ => None,
                    }
                } else {
                    None
                };
                IncomingOutcome::Conflict { notice, message }
            }
            AcceptOutcome::Rejected(reason) => {
                warn!(conversation = %conversation.id, reason = %reason, "Inbound transaction rejected");
                IncomingOutcome::Rejected(reason)
            }
            AcceptOutcome::Duplicate => IncomingOutcome::Duplicate,
            AcceptOutcome::Deferred => IncomingOutcome::Deferred,
        };
        Ok(opened)
    }

    async fn canonical_sequence(
        &self,
        id: ConversationId,
        hash: &TxHash,
    ) -> Result<u64, ClientError> {
        let handle = self.consensus.chain(id)?;
        let chain = handle.lock().await;
        Ok(match chain.status(hash) {
            Some(EntryStatus::Canonical(sequence)) => sequence,
            _ => 0,
        })
    }

    async fn open_message(
        &self,
        conversation: &Conversation,
        tx: &Transaction,
        hash: TxHash,
        sequence: u64,
    ) -> Result<IncomingOutcome, ClientError> {
        match self.decrypt(conversation, tx).await {
            Ok(Some(content)) => {
                debug!(conversation = %conversation.id, seq = sequence, tx = %hash.short(), "Message opened");
                Ok(IncomingOutcome::Delivered(DecryptedMessage {
                    message_id: tx.id,
                    conversation: conversation.id,
                    sender: tx.sender(),
                    hash,
                    sequence,
                    timestamp: tx.timestamp,
                    content,
                }))
            }
            Ok(None) => Ok(IncomingOutcome::NotAddressed { hash }),
            // Local storage failures are not the peer's fault.
            Err(SessionError::Store(e)) => Err(e.into()),
            Err(error) => {
                warn!(
                    conversation = %conversation.id,
                    sender = %tx.sender(),
                    tx = %hash.short(),
                    error = %error,
                    "Canonical transaction could not be opened"
                );
                Ok(IncomingOutcome::Undecryptable { hash, error })
            }
        }
    }

    async fn decrypt(
        &self,
        conversation: &Conversation,
        tx: &Transaction,
    ) -> Result<Option<Content>, SessionError> {
        let sender = tx.sender();
        if sender == self.local {
            return Ok(None);
        }

        let payload = SealedPayload::from_bytes(&tx.payload)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;

        let plaintext = match (&payload, conversation.kind) {
            (SealedPayload::Direct { .. }, ConversationKind::Direct) => {
                let Some(message) = payload.addressed_to(&self.local) else {
                    return Ok(None);
                };
                check_prekey_identity(conversation, &sender, message)?;
                self.engine.decrypt(sender, message).await?
            }
            (SealedPayload::Group { message, .. }, ConversationKind::Group(group)) => {
                if message.group_id != group {
                    return Err(SessionError::Malformed(format!(
                        "group message for {} in conversation of {group}",
                        message.group_id
                    )));
                }
                if let Some(sealed) = payload.addressed_to(&self.local) {
                    check_prekey_identity(conversation, &sender, sealed)?;
                    let bytes = self.engine.decrypt(sender, sealed).await?;
                    let distribution: SenderKeyDistribution = bincode::deserialize(&bytes)
                        .map_err(|e| SessionError::Malformed(e.to_string()))?;
                    self.engine.process_distribution(sender, &distribution).await?;
                }
                self.engine.group_decrypt(sender, message).await?
            }
            _ => {
                return Err(SessionError::Malformed(
                    "payload does not match the conversation kind".into(),
                ))
            }
        };

        let content = match tx.kind {
            PayloadKind::Message => Content::Text(plaintext),
            PayloadKind::CallSignal => Content::CallSignal(
                CallSignal::from_bytes(&plaintext)
                    .map_err(|e| SessionError::Malformed(e.to_string()))?,
            ),
        };
        Ok(Some(content))
    }

    /// Drain transactions handed over by the transport until the channel
    /// closes. Failures are per transaction and never stop the loop.
    pub async fn run_inbound(
        &self,
        mut inbound: mpsc::Receiver<Transaction>,
        reports: mpsc::Sender<IncomingReport>,
    ) {
        info!(device = %self.local, "Inbound loop started");
        while let Some(tx) = inbound.recv().await {
            let hash = tx.hash();
            match self.append_incoming(tx).await {
                Ok(report) => {
                    if reports.send(report).await.is_err() {
                        debug!("Report consumer gone");
                        break;
                    }
                }
                Err(e) => warn!(tx = %hash.short(), error = %e, "Inbound transaction dropped"),
            }
        }
        info!(device = %self.local, "Inbound loop stopped");
    }

    /// Run the delivery scheduler until `shutdown`, recording every
    /// abandoned target on its [`SentRecord`].
    pub async fn run_delivery(&self, shutdown: watch::Receiver<bool>) {
        let mut events = self.delivery_events.lock().await;
        let scheduler = self.queue.run(self.transport.clone(), shutdown);
        tokio::pin!(scheduler);

        loop {
            tokio::select! {
                _ = &mut scheduler => break,
                event = events.recv() => match event {
                    Ok(event) => self.note_delivery_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Delivery events lagged");
                    }
                    Err(RecvError::Closed) => {
                        scheduler.as_mut().await;
                        break;
                    }
                },
            }
        }

        loop {
            match events.try_recv() {
                Ok(event) => self.note_delivery_event(&event),
                Err(TryRecvError::Lagged(missed)) => warn!(missed, "Delivery events lagged"),
                Err(_) => break,
            }
        }
    }

    pub fn notify_connectivity_restored(&self) {
        self.queue.notify_connectivity_restored();
    }

    /// Catch-up replay for a device that has seen up to `sequence`.
    pub async fn chain_since(
        &self,
        id: ConversationId,
        sequence: u64,
    ) -> Result<Vec<Transaction>, ClientError> {
        Ok(self.consensus.get_chain_since(id, sequence).await?)
    }

    pub async fn report_device_seen(
        &self,
        id: ConversationId,
        device: PeerDevice,
        sequence: u64,
    ) -> Result<(), ClientError> {
        self.consensus
            .report_device_seen(id, device, sequence)
            .await?;
        Ok(())
    }

    fn read_conversations(&self) -> RwLockReadGuard<'_, HashMap<ConversationId, Conversation>> {
        self.conversations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_conversations(&self) -> RwLockWriteGuard<'_, HashMap<ConversationId, Conversation>> {
        self.conversations.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A pre-key message must come from the identity registered for its
/// sender, otherwise anyone could open a session in that device's name.
fn check_prekey_identity(
    conversation: &Conversation,
    sender: &PeerDevice,
    message: &RatchetMessage,
) -> Result<(), SessionError> {
    let Some(header) = &message.prekey else {
        return Ok(());
    };
    let registered = conversation
        .participant(sender)
        .map(|p| p.identity)
        .ok_or_else(|| SessionError::Malformed(format!("{sender} is not a participant")))?;
    if header.identity != registered {
        return Err(SessionError::Malformed(format!(
            "pre-key identity of {sender} does not match its registered key"
        )));
    }
    Ok(())
}
