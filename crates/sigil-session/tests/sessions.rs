use std::sync::Arc;

use sigil_session::{
    EncryptionEngine, KeyStore, KeyStoreError, SealedStore, SessionError, SessionPhase,
    TerminationReason,
};
use sigil_shared::config::SessionConfig;
use sigil_shared::{DeviceId, GroupId, PeerDevice, UserId};
use sigil_store::{KeyValueStore, MemoryStore};

struct Device {
    id: PeerDevice,
    engine: EncryptionEngine,
    backend: Arc<dyn KeyValueStore>,
}

async fn device(user: u8, config: SessionConfig) -> Device {
    device_with_backend(user, config, Arc::new(MemoryStore::new())).await
}

async fn device_with_backend(
    user: u8,
    config: SessionConfig,
    backend: Arc<dyn KeyValueStore>,
) -> Device {
    let storage_key = [user; 32];
    let keys = Arc::new(KeyStore::open(backend.clone(), storage_key).unwrap());
    if keys.public_identity().await.is_err() {
        keys.generate_identity().await.unwrap();
    }
    let id = PeerDevice::new(UserId([user; 32]), DeviceId(1));
    let engine = EncryptionEngine::new(
        id,
        keys,
        SealedStore::new(backend.clone(), storage_key),
        config,
    );
    Device {
        id,
        engine,
        backend,
    }
}

fn small_config() -> SessionConfig {
    SessionConfig {
        max_skipped_keys: 10,
        max_stored_skipped_keys: 50,
        one_time_prekeys: 4,
    }
}

async fn connect(alice: &Device, bob: &Device) {
    let bundle = bob
        .engine
        .key_store()
        .generate_prekey_bundle(2)
        .await
        .unwrap();
    alice.engine.establish_outbound(bob.id, &bundle).await.unwrap();
}

#[tokio::test]
async fn round_trip_in_order() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;
    assert_eq!(
        alice.engine.phase(bob.id).await.unwrap(),
        SessionPhase::Established
    );

    let texts: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 10]).collect();
    for text in &texts {
        let message = alice.engine.encrypt(bob.id, text).await.unwrap();
        let plain = bob.engine.decrypt(alice.id, &message).await.unwrap();
        assert_eq!(&plain, text);
    }

    let reply = bob.engine.encrypt(alice.id, b"ack").await.unwrap();
    assert_eq!(alice.engine.decrypt(bob.id, &reply).await.unwrap(), b"ack");
    assert_eq!(
        alice.engine.phase(bob.id).await.unwrap(),
        SessionPhase::Ratcheting
    );
}

#[tokio::test]
async fn out_of_order_then_replay() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let m1 = alice.engine.encrypt(bob.id, b"m1").await.unwrap();
    let m2 = alice.engine.encrypt(bob.id, b"m2").await.unwrap();
    let m3 = alice.engine.encrypt(bob.id, b"m3").await.unwrap();

    assert_eq!(bob.engine.decrypt(alice.id, &m2).await.unwrap(), b"m2");
    assert_eq!(bob.engine.decrypt(alice.id, &m1).await.unwrap(), b"m1");
    assert_eq!(bob.engine.decrypt(alice.id, &m3).await.unwrap(), b"m3");

    let replay = bob.engine.decrypt(alice.id, &m1).await;
    assert!(matches!(replay, Err(SessionError::ReplayOrTooOld)));
}

#[tokio::test]
async fn encrypt_without_session_fails() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    let err = alice.engine.encrypt(bob.id, b"hi").await.unwrap_err();
    assert!(matches!(err, SessionError::SessionNotEstablished(p) if p == bob.id));
}

#[tokio::test]
async fn counter_gap_limit() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let first = alice.engine.encrypt(bob.id, b"first").await.unwrap();
    bob.engine.decrypt(alice.id, &first).await.unwrap();

    let mut last = None;
    for _ in 0..12 {
        last = Some(alice.engine.encrypt(bob.id, b"burst").await.unwrap());
    }
    let err = bob
        .engine
        .decrypt(alice.id, &last.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CounterGapTooLarge { gap: 11, max: 10 }));
    assert!(err.is_peer_fault());
}

#[tokio::test]
async fn failed_authentication_leaves_session_intact() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let first = alice.engine.encrypt(bob.id, b"first").await.unwrap();
    bob.engine.decrypt(alice.id, &first).await.unwrap();

    let second = alice.engine.encrypt(bob.id, b"second").await.unwrap();
    let mut forged = second.clone();
    let last = forged.ciphertext.len() - 1;
    forged.ciphertext[last] ^= 0x01;

    assert!(matches!(
        bob.engine.decrypt(alice.id, &forged).await,
        Err(SessionError::DecryptionFailed)
    ));
    assert_eq!(bob.engine.decrypt(alice.id, &second).await.unwrap(), b"second");
}

#[tokio::test]
async fn one_time_prekey_is_burned_on_first_contact() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;

    let bundle = bob
        .engine
        .key_store()
        .generate_prekey_bundle(1)
        .await
        .unwrap();
    let prekey_id = bundle.one_time_prekeys[0].id;
    alice.engine.establish_outbound(bob.id, &bundle).await.unwrap();

    let hello = alice.engine.encrypt(bob.id, b"hello").await.unwrap();
    assert_eq!(hello.prekey.as_ref().unwrap().one_time_prekey_id, Some(prekey_id));
    bob.engine.decrypt(alice.id, &hello).await.unwrap();

    assert!(matches!(
        bob.engine
            .key_store()
            .consume_one_time_prekey(prekey_id)
            .await,
        Err(KeyStoreError::NotFound(id)) if id == prekey_id
    ));
}

#[tokio::test]
async fn forged_first_message_does_not_burn_prekey() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let hello = alice.engine.encrypt(bob.id, b"hello").await.unwrap();
    let mut forged = hello.clone();
    forged.ciphertext[0] ^= 0xFF;

    assert!(bob.engine.decrypt(alice.id, &forged).await.is_err());
    assert_eq!(bob.engine.key_store().one_time_prekey_count().await, 2);
    assert_eq!(bob.engine.decrypt(alice.id, &hello).await.unwrap(), b"hello");
    assert_eq!(bob.engine.key_store().one_time_prekey_count().await, 1);
}

#[tokio::test]
async fn initiator_messages_before_reply_all_decrypt() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let a = alice.engine.encrypt(bob.id, b"a").await.unwrap();
    let b = alice.engine.encrypt(bob.id, b"b").await.unwrap();
    assert!(b.prekey.is_some());

    assert_eq!(bob.engine.decrypt(alice.id, &a).await.unwrap(), b"a");
    assert_eq!(bob.engine.decrypt(alice.id, &b).await.unwrap(), b"b");

    let reply = bob.engine.encrypt(alice.id, b"r").await.unwrap();
    alice.engine.decrypt(bob.id, &reply).await.unwrap();
    let c = alice.engine.encrypt(bob.id, b"c").await.unwrap();
    assert!(c.prekey.is_none());
    assert_eq!(bob.engine.decrypt(alice.id, &c).await.unwrap(), b"c");
}

#[tokio::test]
async fn reset_terminates_until_new_agreement() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    alice.engine.reset_session(bob.id).await.unwrap();
    assert_eq!(
        alice.engine.phase(bob.id).await.unwrap(),
        SessionPhase::Terminated(TerminationReason::Reset)
    );
    assert!(matches!(
        alice.engine.encrypt(bob.id, b"x").await,
        Err(SessionError::SessionNotEstablished(_))
    ));

    connect(&alice, &bob).await;
    let m = alice.engine.encrypt(bob.id, b"again").await.unwrap();
    assert_eq!(bob.engine.decrypt(alice.id, &m).await.unwrap(), b"again");
}

#[tokio::test]
async fn changed_identity_replaces_session() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;
    let m = alice.engine.encrypt(bob.id, b"one").await.unwrap();
    bob.engine.decrypt(alice.id, &m).await.unwrap();

    // same device id, reinstalled with a fresh identity
    let reinstalled = device(1, small_config()).await;
    connect(&reinstalled, &bob).await;
    let m = reinstalled.engine.encrypt(bob.id, b"two").await.unwrap();
    assert_eq!(bob.engine.decrypt(alice.id, &m).await.unwrap(), b"two");

    // the old session is gone
    let stale = alice.engine.encrypt(bob.id, b"three").await.unwrap();
    assert!(bob.engine.decrypt(alice.id, &stale).await.is_err());
}

#[tokio::test]
async fn sessions_survive_restart() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    connect(&alice, &bob).await;

    let m = alice.engine.encrypt(bob.id, b"before").await.unwrap();
    bob.engine.decrypt(alice.id, &m).await.unwrap();

    let restarted = device_with_backend(2, small_config(), bob.backend.clone()).await;
    let m = alice.engine.encrypt(bob.id, b"after").await.unwrap();
    assert_eq!(restarted.engine.decrypt(alice.id, &m).await.unwrap(), b"after");
}

#[tokio::test]
async fn group_messages_via_sender_keys() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    let carol = device(3, small_config()).await;
    connect(&alice, &bob).await;
    connect(&alice, &carol).await;

    let group = GroupId::new();
    let members = [alice.id, bob.id, carol.id];

    let out = alice
        .engine
        .group_encrypt(group, &members, b"hi group")
        .await
        .unwrap();
    assert_eq!(out.distributions.len(), 2);

    for (member, receiver) in [(bob.id, &bob), (carol.id, &carol)] {
        let dist = out
            .distributions
            .iter()
            .find(|(to, _)| *to == member)
            .map(|(_, d)| d.clone())
            .unwrap();
        receiver
            .engine
            .process_distribution(alice.id, &dist)
            .await
            .unwrap();
        let plain = receiver
            .engine
            .group_decrypt(alice.id, &out.message)
            .await
            .unwrap();
        assert_eq!(plain, b"hi group");
    }

    alice
        .engine
        .mark_distributed(group, out.message.key_id, [bob.id, carol.id])
        .await
        .unwrap();
    let next = alice
        .engine
        .group_encrypt(group, &members, b"second")
        .await
        .unwrap();
    assert!(next.distributions.is_empty());
    assert_eq!(
        bob.engine.group_decrypt(alice.id, &next.message).await.unwrap(),
        b"second"
    );
}

#[tokio::test]
async fn membership_change_rotates_sender_key() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    let carol = device(3, small_config()).await;
    let group = GroupId::new();

    let first = alice
        .engine
        .ensure_sender_key(group, &[alice.id, bob.id, carol.id])
        .await
        .unwrap();
    let same = alice
        .engine
        .ensure_sender_key(group, &[carol.id, alice.id, bob.id])
        .await
        .unwrap();
    assert_eq!(first, same);

    let rotated = alice
        .engine
        .ensure_sender_key(group, &[alice.id, bob.id])
        .await
        .unwrap();
    assert_eq!(rotated, first + 1);
}

#[tokio::test]
async fn distribution_must_come_from_its_sender() {
    let alice = device(1, small_config()).await;
    let bob = device(2, small_config()).await;
    let mallory = device(4, small_config()).await;
    let group = GroupId::new();

    let out = alice
        .engine
        .group_encrypt(group, &[alice.id, bob.id], b"x")
        .await
        .unwrap();
    let (_, dist) = out.distributions[0].clone();

    let err = bob
        .engine
        .process_distribution(mallory.id, &dist)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::SenderKeyMismatch { .. }));
    assert!(matches!(
        bob.engine.group_decrypt(alice.id, &out.message).await,
        Err(SessionError::UnknownSenderKey { .. })
    ));
}
