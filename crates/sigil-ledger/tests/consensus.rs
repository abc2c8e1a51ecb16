use std::sync::Arc;

use chrono::{Duration, Utc};
use sigil_ledger::{
    AcceptOutcome, ChainError, ConsensusHandler, DeviceRecord, EntryStatus, SubmitOutcome,
};
use sigil_shared::config::LedgerConfig;
use sigil_shared::{
    ConversationId, DeviceId, IdentityKeyPair, ManualClock, PayloadKind, PeerDevice, Transaction,
    TransactionSigner, TxHash, UserId,
};
use sigil_store::{Database, KeyValueStore, MemoryStore};

struct Device {
    identity: IdentityKeyPair,
    signer: TransactionSigner,
}

impl Device {
    fn new(user: u8, clock: Arc<ManualClock>) -> Self {
        let identity = IdentityKeyPair::generate();
        let local = PeerDevice::new(UserId([user; 32]), DeviceId(1));
        Self {
            identity,
            signer: TransactionSigner::new(local, clock),
        }
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord::new(self.signer.local(), self.identity.public_key_bytes())
    }

    fn tx(&self, conversation: ConversationId, parent: TxHash, body: &[u8]) -> Transaction {
        self.signer
            .sign(
                &self.identity,
                conversation,
                PayloadKind::Message,
                body.to_vec(),
                parent,
            )
            .unwrap()
    }
}

fn memory_handler() -> ConsensusHandler {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    ConsensusHandler::new(kv, LedgerConfig::default())
}

/// Two branches from genesis plus a child on each.
fn forked_history(
    alice: &Device,
    bob: &Device,
    clock: &ManualClock,
    conversation: ConversationId,
) -> Vec<Transaction> {
    let a1 = alice.tx(conversation, TxHash::GENESIS, b"a1");
    clock.advance(Duration::milliseconds(3));
    let b1 = bob.tx(conversation, TxHash::GENESIS, b"b1");
    clock.advance(Duration::milliseconds(3));
    let a2 = alice.tx(conversation, a1.hash(), b"a2");
    let b2 = bob.tx(conversation, b1.hash(), b"b2");
    vec![a1, b1, a2, b2]
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for rest in permutations(n - 1) {
        for slot in 0..=rest.len() {
            let mut p = rest.clone();
            p.insert(slot, n - 1);
            out.push(p);
        }
    }
    out
}

#[tokio::test]
async fn fork_resolution_ignores_arrival_order() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Device::new(1, clock.clone());
    let bob = Device::new(2, clock.clone());
    let template = ConversationId::new();
    let history = forked_history(&alice, &bob, &clock, template);

    let mut outcomes = Vec::new();
    for order in permutations(history.len()) {
        let handler = memory_handler();
        handler
            .create_conversation(template, [alice.record(), bob.record()])
            .unwrap();
        for index in order {
            handler.accept_remote(history[index].clone()).await.unwrap();
        }

        let handle = handler.chain(template).unwrap();
        let chain = handle.lock().await;
        outcomes.push((chain.canonical_hashes().to_vec(), chain.tip()));
    }

    let expected = vec![history[0].hash(), history[2].hash()];
    for (canonical, tip) in outcomes {
        assert_eq!(canonical, expected);
        assert_eq!(tip, history[2].hash());
    }
}

#[tokio::test]
async fn local_submit_then_remote_fork() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Device::new(1, clock.clone());
    let bob = Device::new(2, clock.clone());
    let handler = memory_handler();
    let conversation = ConversationId::new();
    handler
        .create_conversation(conversation, [alice.record(), bob.record()])
        .unwrap();

    // Bob's transaction is signed first, so it is older than Alice's.
    let remote = bob.tx(conversation, TxHash::GENESIS, b"from bob");
    clock.advance(Duration::milliseconds(10));
    let local = alice.tx(conversation, TxHash::GENESIS, b"from alice");

    let submitted = handler.submit_local(local.clone()).await.unwrap();
    assert_eq!(
        submitted,
        SubmitOutcome::Accepted {
            hash: local.hash(),
            sequence: 1
        }
    );

    let report = handler.accept_remote(remote.clone()).await.unwrap();
    match report.outcome {
        AcceptOutcome::Conflict(notice) => {
            assert!(notice.adopted);
            assert_eq!(notice.orphaned, vec![local.hash()]);
            assert_eq!(notice.ancestor, TxHash::GENESIS);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(handler.current_tip(conversation).await.unwrap(), remote.hash());

    // A local append built on the displaced tip is now stale.
    let stale = alice.tx(conversation, local.hash(), b"too late");
    assert!(matches!(
        handler.submit_local(stale).await.unwrap(),
        SubmitOutcome::Rejected(_)
    ));
}

#[tokio::test]
async fn chain_since_returns_missing_suffix() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Device::new(1, clock.clone());
    let handler = memory_handler();
    let conversation = ConversationId::new();
    handler
        .create_conversation(conversation, [alice.record()])
        .unwrap();

    let mut parent = TxHash::GENESIS;
    let mut hashes = Vec::new();
    for i in 0..5u8 {
        clock.advance(Duration::milliseconds(1));
        let tx = alice.tx(conversation, parent, &[i]);
        parent = tx.hash();
        hashes.push(parent);
        handler.submit_local(tx).await.unwrap();
    }

    let missing = handler.get_chain_since(conversation, 3).await.unwrap();
    let missing: Vec<TxHash> = missing.iter().map(Transaction::hash).collect();
    assert_eq!(missing, hashes[3..].to_vec());
    assert!(handler.get_chain_since(conversation, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_conversation_and_duplicate_create() {
    let handler = memory_handler();
    let conversation = ConversationId::new();

    assert!(matches!(
        handler.current_tip(conversation).await,
        Err(ChainError::UnknownConversation(id)) if id == conversation
    ));

    handler.create_conversation(conversation, Vec::<DeviceRecord>::new()).unwrap();
    assert!(matches!(
        handler.create_conversation(conversation, Vec::<DeviceRecord>::new()),
        Err(ChainError::ConversationExists(_))
    ));
    assert_eq!(
        handler.current_tip(conversation).await.unwrap(),
        TxHash::GENESIS
    );
}

#[tokio::test]
async fn device_progress_is_tracked() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Device::new(1, clock.clone());
    let bob = Device::new(2, clock.clone());
    let handler = memory_handler();
    let conversation = ConversationId::new();
    handler
        .create_conversation(conversation, [alice.record()])
        .unwrap();
    handler
        .add_participant(conversation, bob.record())
        .await
        .unwrap();

    let first = alice.tx(conversation, TxHash::GENESIS, b"one");
    let second = alice.tx(conversation, first.hash(), b"two");
    handler.submit_local(first).await.unwrap();
    handler.submit_local(second).await.unwrap();

    handler
        .report_device_seen(conversation, bob.signer.local(), 1)
        .await
        .unwrap();
    // Claims beyond the chain are clamped.
    handler
        .report_device_seen(conversation, alice.signer.local(), 99)
        .await
        .unwrap();

    let handle = handler.chain(conversation).unwrap();
    let chain = handle.lock().await;
    assert_eq!(
        chain.participant(&bob.signer.local()).unwrap().last_seen_sequence,
        1
    );
    assert_eq!(
        chain.participant(&alice.signer.local()).unwrap().last_seen_sequence,
        2
    );
    drop(chain);

    let stranger = PeerDevice::new(UserId([9u8; 32]), DeviceId(1));
    assert!(matches!(
        handler.report_device_seen(conversation, stranger, 1).await,
        Err(ChainError::UnknownParticipant(_))
    ));
}

#[tokio::test]
async fn history_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Device::new(1, clock.clone());
    let bob = Device::new(2, clock.clone());
    let conversation = ConversationId::new();
    let history = forked_history(&alice, &bob, &clock, conversation);

    let (canonical, orphaned) = {
        let kv: Arc<dyn KeyValueStore> = Arc::new(Database::open_at(&path, &[0u8; 32]).unwrap());
        let handler = ConsensusHandler::new(kv, LedgerConfig::default());
        handler
            .create_conversation(conversation, [alice.record(), bob.record()])
            .unwrap();
        for tx in history.iter().rev() {
            handler.accept_remote(tx.clone()).await.unwrap();
        }
        let handle = handler.chain(conversation).unwrap();
        let chain = handle.lock().await;
        let mut orphaned: Vec<TxHash> = chain.orphaned().iter().map(|tx| tx.hash()).collect();
        orphaned.sort();
        (chain.canonical_hashes().to_vec(), orphaned)
    };

    let kv: Arc<dyn KeyValueStore> = Arc::new(Database::open_at(&path, &[0u8; 32]).unwrap());
    let handler = ConsensusHandler::new(kv, LedgerConfig::default());
    let handle = handler.chain(conversation).unwrap();
    let chain = handle.lock().await;

    assert_eq!(chain.canonical_hashes(), canonical.as_slice());
    let mut reloaded: Vec<TxHash> = chain.orphaned().iter().map(|tx| tx.hash()).collect();
    reloaded.sort();
    assert_eq!(reloaded, orphaned);
    assert_eq!(chain.status(&history[1].hash()), Some(EntryStatus::Orphaned));
    assert_eq!(chain.status(&history[2].hash()), Some(EntryStatus::Canonical(2)));
    assert_eq!(
        chain.participant(&alice.signer.local()).unwrap().last_seen_sequence,
        2
    );
}

#[tokio::test]
async fn conversations_progress_independently() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let alice = Arc::new(Device::new(1, clock.clone()));
    let handler = Arc::new(memory_handler());

    let conversations: Vec<ConversationId> = (0..4).map(|_| ConversationId::new()).collect();
    for id in &conversations {
        handler.create_conversation(*id, [alice.record()]).unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for id in conversations.clone() {
        let handler = handler.clone();
        let alice = alice.clone();
        tasks.spawn(async move {
            let mut parent = TxHash::GENESIS;
            for i in 0..10u8 {
                let tx = alice.tx(id, parent, &[i]);
                parent = tx.hash();
                let outcome = handler.submit_local(tx).await.unwrap();
                assert!(matches!(outcome, SubmitOutcome::Accepted { .. }));
            }
            parent
        });
    }

    let mut tips = Vec::new();
    while let Some(tip) = tasks.join_next().await {
        tips.push(tip.unwrap());
    }
    assert_eq!(tips.len(), conversations.len());

    for id in conversations {
        let handle = handler.chain(id).unwrap();
        assert_eq!(handle.lock().await.len(), 10);
    }
}
