//! Two devices exchanging messages over an in-process transport.
//!
//! Set `SIGIL_DB_PATH` to keep each device's state in SQLite between runs.

use std::path::Path;
use std::sync::Arc;

use sigil_client::{
    init_tracing, ConversationKind, IncomingReport, LedgerManager, ManagerOptions,
};
use sigil_net::{LoopbackTransport, Transport};
use sigil_shared::config::SigilConfig;
use sigil_shared::crypto::derive_key;
use sigil_shared::protocol::CallSignal;
use sigil_shared::{ConversationId, DeviceId, PeerDevice, SystemClock, UserId};
use sigil_store::{Database, KeyValueStore, MemoryStore};
use tokio::sync::{mpsc, watch};
use tracing::info;

fn open_store(db_path: Option<&Path>, name: &str) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    Ok(match db_path {
        Some(path) => {
            let path = path.with_file_name(format!(
                "{}-{name}.db",
                path.file_stem().and_then(|s| s.to_str()).unwrap_or("sigil")
            ));
            Arc::new(Database::open_at(&path, &derive_key("sigil-demo-db", &[name.as_bytes()]))?)
        }
        None => Arc::new(MemoryStore::new()),
    })
}

async fn open_device(
    name: &str,
    local: PeerDevice,
    transport: Arc<dyn Transport>,
    config: &SigilConfig,
) -> anyhow::Result<Arc<LedgerManager>> {
    let manager = LedgerManager::open(ManagerOptions {
        local,
        store: open_store(config.db_path.as_deref(), name)?,
        storage_key: derive_key("sigil-demo-storage", &[name.as_bytes()]),
        transport,
        clock: Arc::new(SystemClock),
        config: config.clone(),
    })?;
    if manager.key_store().public_identity().await.is_err() {
        manager.key_store().generate_identity().await?;
    }
    Ok(Arc::new(manager))
}

fn print_report(device: &str, report: &IncomingReport) {
    for message in report.messages() {
        match &message.content {
            sigil_client::Content::Text(bytes) => info!(
                device,
                from = %message.sender,
                seq = message.sequence,
                text = %String::from_utf8_lossy(bytes),
                "Message received"
            ),
            sigil_client::Content::CallSignal(signal) => info!(
                device,
                from = %message.sender,
                seq = message.sequence,
                signal = ?signal,
                "Call signal received"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = SigilConfig::from_env();
    info!(?config, "Loaded configuration");

    let alice = PeerDevice::new(UserId([0xA1; 32]), DeviceId(1));
    let bob = PeerDevice::new(UserId([0xB0; 32]), DeviceId(1));

    let loopback = LoopbackTransport::new();
    let alice_inbox = loopback.attach(alice);
    let bob_inbox = loopback.attach(bob);
    let transport: Arc<dyn Transport> = Arc::new(loopback.clone());

    let alice_manager = open_device("alice", alice, transport.clone(), &config).await?;
    let bob_manager = open_device("bob", bob, transport, &config).await?;

    let bundle = bob_manager
        .key_store()
        .generate_prekey_bundle(config.session.one_time_prekeys)
        .await?;
    alice_manager.establish_session(bob, &bundle).await?;

    let conversation = ConversationId::new();
    let participants = vec![
        alice_manager.participant().await?,
        bob_manager.participant().await?,
    ];
    alice_manager
        .register_conversation(conversation, ConversationKind::Direct, participants.clone())
        .await?;
    bob_manager
        .register_conversation(conversation, ConversationKind::Direct, participants)
        .await?;

    let (alice_reports_tx, mut alice_reports) = mpsc::channel(64);
    let (bob_reports_tx, mut bob_reports) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = tokio::task::JoinSet::new();
    {
        let manager = alice_manager.clone();
        tasks.spawn(async move { manager.run_inbound(alice_inbox, alice_reports_tx).await });
    }
    {
        let manager = bob_manager.clone();
        tasks.spawn(async move { manager.run_inbound(bob_inbox, bob_reports_tx).await });
    }
    for manager in [alice_manager.clone(), bob_manager.clone()] {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { manager.run_delivery(shutdown).await });
    }

    let mut handle = alice_manager
        .append_outgoing(conversation, b"hello bob")
        .await?;
    handle.settled().await;
    if let Some(report) = bob_reports.recv().await {
        print_report("bob", &report);
    }

    // Link down: the reply waits in Bob's delivery queue until it returns.
    loopback.set_online(false);
    let mut reply = bob_manager
        .append_outgoing(conversation, b"hi alice, sorry for the delay")
        .await?;
    info!(status = ?reply.status(), "Reply queued while offline");
    loopback.set_online(true);
    bob_manager.notify_connectivity_restored();
    reply.settled().await;
    if let Some(report) = alice_reports.recv().await {
        print_report("alice", &report);
    }

    alice_manager
        .append_call_signal(conversation, &CallSignal::Offer("v=0".into()))
        .await?
        .settled()
        .await;
    if let Some(report) = bob_reports.recv().await {
        print_report("bob", &report);
    }

    let tip = alice_manager.consensus().current_tip(conversation).await?;
    info!(conversation = %conversation, tip = %tip.short(), "Demo finished");

    shutdown_tx.send(true)?;
    drop(alice_manager);
    drop(bob_manager);
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    Ok(())
}
