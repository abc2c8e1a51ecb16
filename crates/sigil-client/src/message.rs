use chrono::{DateTime, Utc};
use sigil_ledger::{ConflictNotice, RejectReason};
use sigil_net::{DeliveryStatus, TargetStatus};
use sigil_session::SessionError;
use sigil_shared::protocol::CallSignal;
use sigil_shared::{ConversationId, MessageId, PeerDevice, TxHash};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(Vec<u8>),
    CallSignal(CallSignal),
}

/// An inbound transaction after it joined canonical history and was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub message_id: MessageId,
    pub conversation: ConversationId,
    pub sender: PeerDevice,
    pub hash: TxHash,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub content: Content,
}

#[derive(Debug)]
pub enum IncomingOutcome {
    Delivered(DecryptedMessage),

    /// A fork was resolved. The message is present only when the incoming
    /// transaction won and could be opened.
    Conflict {
        notice: ConflictNotice,
        message: Option<DecryptedMessage>,
    },

    Rejected(RejectReason),

    Duplicate,

    /// Waiting for its parent.
    Deferred,

    /// Canonical, but carries nothing for this device.
    NotAddressed { hash: TxHash },

    /// Canonical, but could not be opened. History is unaffected.
    Undecryptable { hash: TxHash, error: SessionError },
}

impl IncomingOutcome {
    pub fn message(&self) -> Option<&DecryptedMessage> {
        match self {
            IncomingOutcome::Delivered(message) => Some(message),
            IncomingOutcome::Conflict { message, .. } => message.as_ref(),
            _ => None,
        }
    }
}

/// Outcome for one inbound transaction plus every buffered transaction it
/// released, in the order they joined the chain.
#[derive(Debug)]
pub struct IncomingReport {
    pub outcome: IncomingOutcome,
    pub released: Vec<IncomingOutcome>,
}

impl IncomingReport {
    /// Every message made readable by this arrival.
    pub fn messages(&self) -> impl Iterator<Item = &DecryptedMessage> {
        std::iter::once(&self.outcome)
            .chain(self.released.iter())
            .filter_map(IncomingOutcome::message)
    }
}

/// Returned by an outgoing append once the transaction is in the local
/// chain. Observes delivery to every recipient device.
#[derive(Debug, Clone)]
pub struct TransmissionHandle {
    pub message_id: MessageId,
    pub conversation: ConversationId,
    pub hash: TxHash,
    pub sequence: u64,
    status: watch::Receiver<TargetStatus>,
}

impl TransmissionHandle {
    pub(crate) fn new(
        message_id: MessageId,
        conversation: ConversationId,
        hash: TxHash,
        sequence: u64,
        status: watch::Receiver<TargetStatus>,
    ) -> Self {
        Self {
            message_id,
            conversation,
            hash,
            sequence,
            status,
        }
    }

    pub fn status(&self) -> TargetStatus {
        self.status.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.status.borrow().values().all(DeliveryStatus::is_terminal)
    }

    pub fn is_delivered(&self) -> bool {
        self.status
            .borrow()
            .values()
            .all(|s| *s == DeliveryStatus::Delivered)
    }

    /// Targets whose delivery was abandoned.
    pub fn failed(&self) -> Vec<PeerDevice> {
        self.status
            .borrow()
            .iter()
            .filter(|(_, s)| **s == DeliveryStatus::Abandoned)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Wait until every target is delivered, abandoned or cancelled.
    pub async fn settled(&mut self) -> TargetStatus {
        let settled = |map: &TargetStatus| map.values().all(DeliveryStatus::is_terminal);
        if let Ok(status) = self.status.wait_for(settled).await {
            return status.clone();
        }
        // Sender gone: the last published value is final.
        self.status.borrow().clone()
    }
}
