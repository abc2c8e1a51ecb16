use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sigil_net::{
    DeliveryEvent, DeliveryQueue, DeliveryStatus, LoopbackTransport, ScriptedTransport, Transport,
};
use sigil_shared::config::{DeliveryConfig, RetryPolicy};
use sigil_shared::{
    ConversationId, DeviceId, IdentityKeyPair, ManualClock, MessageId, PayloadKind, PeerDevice,
    SystemClock, Transaction, TransactionSigner, TxHash, UserId,
};
use sigil_store::{Database, KeyValueStore, MemoryStore};
use tokio::sync::watch;

fn config() -> DeliveryConfig {
    DeliveryConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_attempts: 10,
            jitter: 0.5,
        },
        scan_interval: Duration::from_millis(5),
        transport_workers: 4,
        send_timeout: Duration::from_millis(500),
    }
}

fn transaction() -> Transaction {
    let identity = IdentityKeyPair::generate();
    let local = PeerDevice::new(UserId([1u8; 32]), DeviceId(1));
    TransactionSigner::new(local, Arc::new(SystemClock))
        .sign(
            &identity,
            ConversationId::new(),
            PayloadKind::Message,
            b"hello".to_vec(),
            TxHash::GENESIS,
        )
        .unwrap()
}

fn device(n: u8) -> PeerDevice {
    PeerDevice::new(UserId([n; 32]), DeviceId(1))
}

#[tokio::test]
async fn scheduler_delivers_once_link_returns() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(DeliveryQueue::open(kv, config(), Arc::new(SystemClock)).unwrap());
    let loopback = LoopbackTransport::new();
    let bob = device(2);
    let mut inbox = loopback.attach(bob);
    loopback.set_online(false);

    let mut events = queue.subscribe();
    let tx = transaction();
    let id = MessageId::new();
    let status = queue.track(id, [(bob, DeliveryStatus::Pending)].into());
    queue.enqueue(id, bob, tx.clone()).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport: Arc<dyn Transport> = Arc::new(loopback.clone());
    let runner = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run(transport, shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(queue.get(id, bob).is_some());

    loopback.set_online(true);
    queue.notify_connectivity_restored();

    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, tx);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DeliveryEvent::Delivered {
            message_id: id,
            target: bob
        }
    );
    assert_eq!(status.borrow().get(&bob), Some(&DeliveryStatus::Delivered));

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn worker_pool_handles_many_targets() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = DeliveryQueue::open(kv, config(), clock).unwrap();
    let transport = Arc::new(ScriptedTransport::new());

    let tx = transaction();
    let id = MessageId::new();
    for n in 2..22u8 {
        queue.enqueue(id, device(n), tx.clone()).unwrap();
    }

    let summary = queue.run_once(transport.clone()).await.unwrap();
    assert_eq!(summary.attempted, 20);
    assert_eq!(summary.delivered, 20);
    assert_eq!(transport.delivered().len(), 20);
}

#[tokio::test]
async fn queue_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let id = MessageId::new();
    let bob = device(2);

    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(Database::open_at(&path, &[0u8; 32]).unwrap());
        let queue = DeliveryQueue::open(kv, config(), clock.clone()).unwrap();
        queue.enqueue(id, bob, transaction()).unwrap();
        let failing = Arc::new(ScriptedTransport::failing(1));
        queue.run_once(failing).await.unwrap();
        assert_eq!(queue.get(id, bob).unwrap().attempt_count, 1);
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(Database::open_at(&path, &[0u8; 32]).unwrap());
    let queue = DeliveryQueue::open(kv, config(), clock.clone()).unwrap();
    let restored = queue.get(id, bob).unwrap();
    assert_eq!(restored.status, DeliveryStatus::Pending);
    assert_eq!(restored.attempt_count, 1);

    clock.advance(chrono::Duration::seconds(1));
    let transport = Arc::new(ScriptedTransport::new());
    assert_eq!(queue.run_once(transport).await.unwrap().delivered, 1);
    assert!(queue.is_empty());
}
