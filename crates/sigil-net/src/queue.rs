//! Delivery Queue.
//!
//! Holds transactions the transport could not take synchronously and
//! retries them with [`Backoff`] until they are delivered or abandoned.
//!
//! ```text
//! Pending -> InFlight -> Delivered            (entry removed)
//!                     -> Pending (retry)      attempt_count += 1
//!                     -> Abandoned            attempt ceiling reached
//! ```
//!
//! Entries are persisted as JSON under `queue:<message>:<user>:<device>` so
//! a restart resumes the schedule. Progress is reported twice: as
//! [`DeliveryEvent`]s on a broadcast channel and as a per-message
//! [`DeliveryStatus`] map on a `watch` channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sigil_shared::config::{DeliveryConfig, MIN_SCAN_INTERVAL};
use sigil_shared::{Clock, MessageId, PeerDevice, Transaction};
use sigil_store::KeyValueStore;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{DeliveryError, TransportError};
use crate::transport::{Ack, Transport};

const QUEUE_PREFIX: &str = "queue:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Abandoned,
    /// Withdrawn by the sender before it was delivered
    Cancelled,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Abandoned | DeliveryStatus::Cancelled
        )
    }
}

/// Per-target status of one message.
pub type TargetStatus = BTreeMap<PeerDevice, DeliveryStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedDelivery {
    pub message_id: MessageId,
    pub target: PeerDevice,
    pub transaction: Transaction,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_error: Option<TransportError>,
}

impl QueuedDelivery {
    fn key(&self) -> EntryKey {
        (self.message_id, self.target)
    }

    fn storage_key(&self) -> String {
        storage_key(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered {
        message_id: MessageId,
        target: PeerDevice,
    },
    Abandoned {
        message_id: MessageId,
        target: PeerDevice,
        attempts: u32,
        last_error: TransportError,
    },
    Cancelled {
        message_id: MessageId,
        target: PeerDevice,
    },
}

impl DeliveryEvent {
    pub fn message_id(&self) -> MessageId {
        match self {
            DeliveryEvent::Delivered { message_id, .. }
            | DeliveryEvent::Abandoned { message_id, .. }
            | DeliveryEvent::Cancelled { message_id, .. } => *message_id,
        }
    }

    /// The terminal error for an abandoned delivery.
    pub fn failure(&self) -> Option<DeliveryError> {
        match self {
            DeliveryEvent::Abandoned {
                message_id,
                target,
                attempts,
                last_error,
            } => Some(DeliveryError::QueueAbandoned {
                message_id: *message_id,
                target: *target,
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
            _ => None,
        }
    }
}

/// Counts from one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
}

type EntryKey = (MessageId, PeerDevice);

fn storage_key((message_id, target): &EntryKey) -> String {
    format!("{QUEUE_PREFIX}{message_id}:{}", target.storage_key())
}

struct Entry {
    delivery: QueuedDelivery,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<EntryKey, Entry>,
    watches: HashMap<MessageId, watch::Sender<TargetStatus>>,
    /// Set by a connectivity-restored signal: every pending entry is due on
    /// the next pass regardless of its schedule.
    eager: bool,
}

impl QueueState {
    fn publish(&mut self, message_id: MessageId, target: PeerDevice, status: DeliveryStatus) {
        let Some(sender) = self.watches.get(&message_id) else {
            return;
        };
        sender.send_modify(|map| {
            map.insert(target, status);
        });
        let finished = sender.borrow().values().all(DeliveryStatus::is_terminal);
        if finished {
            self.watches.remove(&message_id);
        }
    }
}

pub struct DeliveryQueue {
    store: Arc<dyn KeyValueStore>,
    config: DeliveryConfig,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryQueue {
    /// Open the queue and resume whatever a previous run left behind.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeliveryError> {
        let (events, _) = broadcast::channel(256);
        let queue = Self {
            store,
            backoff: Backoff::new(config.retry.clone()),
            workers: Arc::new(Semaphore::new(config.transport_workers.max(1))),
            config,
            clock,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            events,
        };
        queue.restore()?;
        Ok(queue)
    }

    /// Reload persisted entries. Anything caught `InFlight` by a crash goes
    /// back to `Pending`; the attempt it was making is not counted. Restored
    /// messages are tracked again, so [`DeliveryQueue::track`] picks up
    /// their progress.
    pub fn restore(&self) -> Result<usize, DeliveryError> {
        let records = self.store.scan_prefix(QUEUE_PREFIX)?;
        let mut state = self.lock();
        let mut restored = 0;

        for (key, bytes) in records {
            let mut delivery: QueuedDelivery = serde_json::from_slice(&bytes)
                .map_err(|e| DeliveryError::Corrupt(format!("{key}: {e}")))?;
            if delivery.status == DeliveryStatus::InFlight {
                delivery.status = DeliveryStatus::Pending;
                self.store.put_json(&key, &delivery)?;
            }
            let (message_id, target) = delivery.key();
            state
                .watches
                .entry(message_id)
                .or_insert_with(|| watch::channel(TargetStatus::new()).0)
                .send_modify(|map| {
                    map.insert(target, DeliveryStatus::Pending);
                });
            state.entries.insert(
                delivery.key(),
                Entry {
                    delivery,
                    abort: None,
                },
            );
            restored += 1;
        }

        if restored > 0 {
            info!(entries = restored, "Delivery queue restored");
        }
        Ok(restored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Start reporting per-target status for `message_id`.
    pub fn track(&self, message_id: MessageId, initial: TargetStatus) -> watch::Receiver<TargetStatus> {
        let mut state = self.lock();
        if let Some(sender) = state.watches.get(&message_id) {
            sender.send_modify(|map| map.extend(initial));
            return sender.subscribe();
        }

        let finished = initial.values().all(DeliveryStatus::is_terminal);
        let (sender, receiver) = watch::channel(initial);
        if !finished {
            state.watches.insert(message_id, sender);
        }
        receiver
    }

    /// Queue `transaction` for delivery to `target`, due immediately.
    pub fn enqueue(
        &self,
        message_id: MessageId,
        target: PeerDevice,
        transaction: Transaction,
    ) -> Result<(), DeliveryError> {
        self.enqueue_failed(message_id, target, transaction, None)
            .map(|_| ())
    }

    /// Queue a delivery whose first, synchronous attempt already failed. That
    /// attempt counts towards the retry ceiling; when it alone reaches the
    /// ceiling nothing is queued and the delivery is abandoned on the spot.
    pub fn enqueue_failed(
        &self,
        message_id: MessageId,
        target: PeerDevice,
        transaction: Transaction,
        error: Option<TransportError>,
    ) -> Result<DeliveryStatus, DeliveryError> {
        let now = self.clock.now();
        let attempt_count = u32::from(error.is_some());
        if let Some(err) = error.as_ref().filter(|_| self.backoff.exhausted(attempt_count)) {
            self.lock()
                .publish(message_id, target, DeliveryStatus::Abandoned);
            error!(
                message = %message_id,
                target = %target,
                attempts = attempt_count,
                error = %err,
                "Delivery abandoned"
            );
            let _ = self.events.send(DeliveryEvent::Abandoned {
                message_id,
                target,
                attempts: attempt_count,
                last_error: err.clone(),
            });
            return Ok(DeliveryStatus::Abandoned);
        }
        let next_attempt_at = if error.is_some() {
            self.backoff.next_attempt_at(now, now, attempt_count)
        } else {
            now
        };
        let delivery = QueuedDelivery {
            message_id,
            target,
            transaction,
            attempt_count,
            next_attempt_at,
            status: DeliveryStatus::Pending,
            last_error: error,
        };

        self.store.put_json(&delivery.storage_key(), &delivery)?;
        let mut state = self.lock();
        state.entries.insert(
            delivery.key(),
            Entry {
                delivery,
                abort: None,
            },
        );
        state.publish(message_id, target, DeliveryStatus::Pending);
        drop(state);

        debug!(message = %message_id, target = %target, "Delivery queued");
        self.wake.notify_one();
        Ok(DeliveryStatus::Pending)
    }

    pub fn get(&self, message_id: MessageId, target: PeerDevice) -> Option<QueuedDelivery> {
        self.lock()
            .entries
            .get(&(message_id, target))
            .map(|e| e.delivery.clone())
    }

    pub fn entries(&self) -> Vec<QueuedDelivery> {
        self.lock()
            .entries
            .values()
            .map(|e| e.delivery.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending entries the next pass would attempt.
    pub fn due(&self) -> Vec<QueuedDelivery> {
        let now = self.clock.now();
        let state = self.lock();
        state
            .entries
            .values()
            .filter(|e| is_due(&e.delivery, now, state.eager))
            .map(|e| e.delivery.clone())
            .collect()
    }

    /// Connectivity came back: retry every pending entry now instead of
    /// waiting for its backoff to elapse.
    pub fn notify_connectivity_restored(&self) {
        let pending = {
            let mut state = self.lock();
            state.eager = true;
            state
                .entries
                .values()
                .filter(|e| e.delivery.status == DeliveryStatus::Pending)
                .count()
        };
        info!(pending, "Connectivity restored, rescanning delivery queue");
        self.wake.notify_one();
    }

    /// Withdraw every queued or in-flight delivery of `message_id`. Returns
    /// the targets that were cancelled.
    pub fn cancel(&self, message_id: MessageId) -> Result<Vec<PeerDevice>, DeliveryError> {
        let removed: Vec<Entry> = {
            let mut state = self.lock();
            let keys: Vec<EntryKey> = state
                .entries
                .keys()
                .filter(|(id, _)| *id == message_id)
                .copied()
                .collect();
            let removed: Vec<Entry> = keys
                .iter()
                .filter_map(|k| state.entries.remove(k))
                .collect();
            for entry in &removed {
                state.publish(message_id, entry.delivery.target, DeliveryStatus::Cancelled);
            }
            removed
        };

        let mut targets = Vec::with_capacity(removed.len());
        for entry in removed {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            self.store.delete(&entry.delivery.storage_key())?;
            let target = entry.delivery.target;
            let _ = self.events.send(DeliveryEvent::Cancelled { message_id, target });
            targets.push(target);
        }

        if !targets.is_empty() {
            info!(message = %message_id, targets = targets.len(), "Delivery cancelled");
        }
        Ok(targets)
    }

    /// One scheduler pass: attempt every due entry through the bounded
    /// worker pool and wait for the results.
    pub async fn run_once(&self, transport: Arc<dyn Transport>) -> Result<RunSummary, DeliveryError> {
        let now = self.clock.now();
        let due: Vec<QueuedDelivery> = {
            let mut state = self.lock();
            let eager = std::mem::take(&mut state.eager);
            let mut due = Vec::new();
            for entry in state.entries.values_mut() {
                if is_due(&entry.delivery, now, eager) {
                    entry.delivery.status = DeliveryStatus::InFlight;
                    due.push(entry.delivery.clone());
                }
            }
            for delivery in &due {
                state.publish(delivery.message_id, delivery.target, DeliveryStatus::InFlight);
            }
            due
        };

        let mut summary = RunSummary::default();
        if due.is_empty() {
            return Ok(summary);
        }
        for delivery in &due {
            self.store.put_json(&delivery.storage_key(), delivery)?;
        }

        let mut attempts = JoinSet::new();
        for delivery in due {
            let key = delivery.key();
            let transport = transport.clone();
            let workers = self.workers.clone();
            let timeout = self.config.send_timeout;

            let abort = attempts.spawn(async move {
                let _permit = workers.acquire_owned().await;
                let result = match tokio::time::timeout(
                    timeout,
                    transport.send(delivery.target, &delivery.transaction),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };
                (key, result)
            });
            if let Some(entry) = self.lock().entries.get_mut(&key) {
                entry.abort = Some(abort);
            }
            summary.attempted += 1;
        }

        while let Some(joined) = attempts.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                // Aborted by cancel(); the entry is already gone.
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!(error = %e, "Delivery attempt panicked");
                    continue;
                }
            };
            match self.settle(key, result)? {
                Some(DeliveryStatus::Delivered) => summary.delivered += 1,
                Some(DeliveryStatus::Abandoned) => summary.abandoned += 1,
                Some(_) => summary.retried += 1,
                None => {}
            }
        }

        debug!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            retried = summary.retried,
            abandoned = summary.abandoned,
            "Delivery pass finished"
        );
        Ok(summary)
    }

    /// Record the result of one attempt. Returns the entry's new status, or
    /// `None` if it was cancelled meanwhile.
    fn settle(
        &self,
        key: EntryKey,
        result: Result<Ack, TransportError>,
    ) -> Result<Option<DeliveryStatus>, DeliveryError> {
        let (message_id, target) = key;
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(None);
        };
        entry.abort = None;

        match result {
            Ok(ack) => {
                state.entries.remove(&key);
                state.publish(message_id, target, DeliveryStatus::Delivered);
                drop(state);
                self.store.delete(&storage_key(&key))?;

                debug!(message = %message_id, target = %target, tx = %ack.hash.short(), "Delivered");
                let _ = self.events.send(DeliveryEvent::Delivered { message_id, target });
                Ok(Some(DeliveryStatus::Delivered))
            }
            Err(err) => {
                let delivery = &mut entry.delivery;
                delivery.attempt_count += 1;
                delivery.last_error = Some(err.clone());

                if self.backoff.exhausted(delivery.attempt_count) {
                    let attempts = delivery.attempt_count;
                    state.entries.remove(&key);
                    state.publish(message_id, target, DeliveryStatus::Abandoned);
                    drop(state);
                    self.store.delete(&storage_key(&key))?;

                    error!(
                        message = %message_id,
                        target = %target,
                        attempts,
                        error = %err,
                        "Delivery abandoned"
                    );
                    let _ = self.events.send(DeliveryEvent::Abandoned {
                        message_id,
                        target,
                        attempts,
                        last_error: err,
                    });
                    return Ok(Some(DeliveryStatus::Abandoned));
                }

                let now = self.clock.now();
                delivery.next_attempt_at =
                    self.backoff
                        .next_attempt_at(now, delivery.next_attempt_at, delivery.attempt_count);
                delivery.status = DeliveryStatus::Pending;
                let snapshot = delivery.clone();
                state.publish(message_id, target, DeliveryStatus::Pending);
                drop(state);
                self.store.put_json(&snapshot.storage_key(), &snapshot)?;

                warn!(
                    message = %message_id,
                    target = %target,
                    attempt = snapshot.attempt_count,
                    retry_at = %snapshot.next_attempt_at,
                    error = %err,
                    "Delivery failed, will retry"
                );
                Ok(Some(DeliveryStatus::Pending))
            }
        }
    }

    /// Scheduler loop: a pass on every timer tick, enqueue or connectivity
    /// signal, until `shutdown` flips to `true`.
    pub async fn run(&self, transport: Arc<dyn Transport>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval.max(MIN_SCAN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(workers = self.config.transport_workers, "Delivery queue running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once(transport.clone()).await {
                error!(error = %e, "Delivery pass failed");
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Delivery queue stopped");
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_due(delivery: &QueuedDelivery, now: DateTime<Utc>, eager: bool) -> bool {
    delivery.status == DeliveryStatus::Pending && (eager || delivery.next_attempt_at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use sigil_shared::config::RetryPolicy;
    use sigil_shared::{
        ConversationId, DeviceId, IdentityKeyPair, ManualClock, PayloadKind, TransactionSigner,
        TxHash, UserId,
    };
    use sigil_store::MemoryStore;
    use std::time::Duration;

    fn config(max_attempts: u32) -> DeliveryConfig {
        DeliveryConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_attempts,
                jitter: 0.5,
            },
            scan_interval: Duration::from_millis(10),
            transport_workers: 2,
            send_timeout: Duration::from_secs(1),
        }
    }

    fn transaction(clock: Arc<ManualClock>) -> Transaction {
        let identity = IdentityKeyPair::generate();
        let local = PeerDevice::new(UserId([1u8; 32]), DeviceId(1));
        TransactionSigner::new(local, clock)
            .sign(
                &identity,
                ConversationId::new(),
                PayloadKind::Message,
                b"queued".to_vec(),
                TxHash::GENESIS,
            )
            .unwrap()
    }

    fn bob() -> PeerDevice {
        PeerDevice::new(UserId([2u8; 32]), DeviceId(1))
    }

    #[tokio::test]
    async fn backoff_is_strictly_monotonic_until_abandoned() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv, config(5), clock.clone()).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_always_fail(true);
        let mut events = queue.subscribe();

        let id = MessageId::new();
        queue.enqueue(id, bob(), transaction(clock.clone())).unwrap();

        let mut schedule = Vec::new();
        for _ in 0..5 {
            let summary = queue.run_once(transport.clone()).await.unwrap();
            assert_eq!(summary.attempted, 1);
            match queue.get(id, bob()) {
                Some(entry) => {
                    assert_eq!(entry.status, DeliveryStatus::Pending);
                    schedule.push(entry.next_attempt_at);
                    clock.set(entry.next_attempt_at);
                }
                None => break,
            }
        }

        assert_eq!(schedule.len(), 4);
        assert!(schedule.windows(2).all(|w| w[0] < w[1]));
        assert!(queue.is_empty());

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.failure(),
            Some(DeliveryError::QueueAbandoned { attempts: 5, .. })
        ));
    }

    #[tokio::test]
    async fn not_retried_before_schedule() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv, config(8), clock.clone()).unwrap();
        let transport = Arc::new(ScriptedTransport::failing(1));

        let id = MessageId::new();
        queue.enqueue(id, bob(), transaction(clock.clone())).unwrap();
        queue.run_once(transport.clone()).await.unwrap();

        // Nothing is due until the clock reaches the retry time.
        assert!(queue.due().is_empty());
        assert_eq!(queue.run_once(transport.clone()).await.unwrap().attempted, 0);

        clock.advance(chrono::Duration::seconds(1));
        let summary = queue.run_once(transport.clone()).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(queue.is_empty());
        assert_eq!(transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn connectivity_restore_makes_everything_due() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv, config(8), clock.clone()).unwrap();
        let transport = Arc::new(ScriptedTransport::failing(3));

        for _ in 0..3 {
            queue
                .enqueue(MessageId::new(), bob(), transaction(clock.clone()))
                .unwrap();
        }
        queue.run_once(transport.clone()).await.unwrap();
        assert!(queue.due().is_empty());

        queue.notify_connectivity_restored();
        assert_eq!(queue.due().len(), 3);

        let summary = queue.run_once(transport.clone()).await.unwrap();
        assert_eq!(summary.delivered, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn restart_returns_in_flight_to_pending() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tx = transaction(clock.clone());
        let id = MessageId::new();

        let stranded = QueuedDelivery {
            message_id: id,
            target: bob(),
            transaction: tx,
            attempt_count: 2,
            next_attempt_at: clock.now(),
            status: DeliveryStatus::InFlight,
            last_error: Some(TransportError::Timeout),
        };
        kv.put_json(&stranded.storage_key(), &stranded).unwrap();

        let queue = DeliveryQueue::open(kv.clone(), config(8), clock.clone()).unwrap();
        let restored = queue.get(id, bob()).unwrap();
        assert_eq!(restored.status, DeliveryStatus::Pending);
        assert_eq!(restored.attempt_count, 2);

        let persisted: QueuedDelivery = kv.get_json(&stranded.storage_key()).unwrap().unwrap();
        assert_eq!(persisted.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_removes_entries_and_reports() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv.clone(), config(8), clock.clone()).unwrap();
        let carol = PeerDevice::new(UserId([3u8; 32]), DeviceId(4));

        let id = MessageId::new();
        let tx = transaction(clock.clone());
        let status = queue.track(
            id,
            [(bob(), DeliveryStatus::Pending), (carol, DeliveryStatus::Pending)].into(),
        );
        queue.enqueue(id, bob(), tx.clone()).unwrap();
        queue.enqueue(id, carol, tx).unwrap();
        let other = MessageId::new();
        queue.enqueue(other, bob(), transaction(clock.clone())).unwrap();

        let mut cancelled = queue.cancel(id).unwrap();
        cancelled.sort();
        let mut expected = vec![bob(), carol];
        expected.sort();
        assert_eq!(cancelled, expected);

        assert_eq!(queue.len(), 1);
        assert!(queue.get(other, bob()).is_some());
        assert_eq!(kv.scan_prefix(QUEUE_PREFIX).unwrap().len(), 1);
        assert!(status
            .borrow()
            .values()
            .all(|s| *s == DeliveryStatus::Cancelled));
    }

    #[tokio::test]
    async fn watch_reports_delivery() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv, config(8), clock.clone()).unwrap();
        let transport = Arc::new(ScriptedTransport::new());

        let id = MessageId::new();
        let status = queue.track(id, [(bob(), DeliveryStatus::Pending)].into());
        queue.enqueue(id, bob(), transaction(clock.clone())).unwrap();
        queue.run_once(transport).await.unwrap();

        assert_eq!(status.borrow().get(&bob()), Some(&DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn single_attempt_ceiling_abandons_at_enqueue() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = DeliveryQueue::open(kv.clone(), config(1), clock.clone()).unwrap();
        let mut events = queue.subscribe();

        let id = MessageId::new();
        let status = queue.track(id, [(bob(), DeliveryStatus::Pending)].into());
        let outcome = queue
            .enqueue_failed(id, bob(), transaction(clock.clone()), Some(TransportError::Offline))
            .unwrap();

        assert_eq!(outcome, DeliveryStatus::Abandoned);
        assert!(queue.is_empty());
        assert!(kv.scan_prefix(QUEUE_PREFIX).unwrap().is_empty());
        assert_eq!(status.borrow().get(&bob()), Some(&DeliveryStatus::Abandoned));
        assert_eq!(
            events.recv().await.unwrap(),
            DeliveryEvent::Abandoned {
                message_id: id,
                target: bob(),
                attempts: 1,
                last_error: TransportError::Offline,
            }
        );
    }

    #[tokio::test]
    async fn restored_entries_report_progress() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let id = MessageId::new();
        let stranded = QueuedDelivery {
            message_id: id,
            target: bob(),
            transaction: transaction(clock.clone()),
            attempt_count: 2,
            next_attempt_at: clock.now(),
            status: DeliveryStatus::Pending,
            last_error: Some(TransportError::Timeout),
        };
        kv.put_json(&stranded.storage_key(), &stranded).unwrap();

        let queue = DeliveryQueue::open(kv, config(3), clock.clone()).unwrap();
        let status = queue.track(id, TargetStatus::new());
        assert_eq!(status.borrow().get(&bob()), Some(&DeliveryStatus::Pending));

        let transport = Arc::new(ScriptedTransport::new());
        transport.set_always_fail(true);
        let summary = queue.run_once(transport).await.unwrap();
        assert_eq!(summary.abandoned, 1);
        assert_eq!(status.borrow().get(&bob()), Some(&DeliveryStatus::Abandoned));
    }

    #[tokio::test]
    async fn zero_scan_interval_still_runs() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut config = config(3);
        config.scan_interval = Duration::ZERO;
        let queue = Arc::new(DeliveryQueue::open(kv, config, clock.clone()).unwrap());
        let transport = Arc::new(ScriptedTransport::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let queue = queue.clone();
            let transport: Arc<dyn Transport> = transport.clone();
            tokio::spawn(async move { queue.run(transport, shutdown_rx).await })
        };

        queue.enqueue(MessageId::new(), bob(), transaction(clock.clone())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        assert_eq!(transport.delivered().len(), 1);
    }
}
