//! Transport boundary.
//!
//! The core never opens sockets itself. Outgoing transactions go through a
//! [`Transport`]; incoming ones arrive on an `mpsc` channel that the client
//! drains. [`LoopbackTransport`] connects devices inside one process, and
//! [`ScriptedTransport`] fails on demand.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sigil_shared::{PeerDevice, Transaction, TxHash};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

/// Receipt for a transaction handed to a peer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub hash: TxHash,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: PeerDevice, tx: &Transaction) -> Result<Ack, TransportError>;
}

/// In-process network: every attached device gets a mailbox.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackInner>>,
}

struct LoopbackInner {
    mailboxes: HashMap<PeerDevice, mpsc::Sender<Transaction>>,
    unreachable: HashSet<PeerDevice>,
    online: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackInner {
                mailboxes: HashMap::new(),
                unreachable: HashSet::new(),
                online: true,
            })),
        }
    }

    /// Attach `device`, returning the channel its incoming transactions
    /// arrive on. Re-attaching replaces the previous mailbox.
    pub fn attach(&self, device: PeerDevice) -> mpsc::Receiver<Transaction> {
        let (tx, rx) = mpsc::channel(256);
        self.lock().mailboxes.insert(device, tx);
        rx
    }

    /// Toggle connectivity for every send through this transport.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn set_reachable(&self, device: PeerDevice, reachable: bool) {
        let mut inner = self.lock();
        if reachable {
            inner.unreachable.remove(&device);
        } else {
            inner.unreachable.insert(device);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, target: PeerDevice, tx: &Transaction) -> Result<Ack, TransportError> {
        let mailbox = {
            let inner = self.lock();
            if !inner.online {
                return Err(TransportError::Offline);
            }
            if inner.unreachable.contains(&target) {
                return Err(TransportError::Unreachable(target));
            }
            inner
                .mailboxes
                .get(&target)
                .cloned()
                .ok_or(TransportError::Unreachable(target))?
        };

        let hash = tx.hash();
        mailbox
            .send(tx.clone())
            .await
            .map_err(|_| TransportError::Unreachable(target))?;
        debug!(target = %target, tx = %hash.short(), "Loopback delivery");
        Ok(Ack { hash })
    }
}

/// Transport whose failures are set up in advance.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Script>>,
}

#[derive(Default)]
struct Script {
    failures_left: u32,
    always_fail: bool,
    attempts: Vec<(PeerDevice, TxHash)>,
    delivered: Vec<(PeerDevice, TxHash)>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends, then succeed.
    pub fn failing(n: u32) -> Self {
        let transport = Self::default();
        transport.lock().failures_left = n;
        transport
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.lock().always_fail = fail;
    }

    /// Every send attempted so far, successful or not.
    pub fn attempts(&self) -> Vec<(PeerDevice, TxHash)> {
        self.lock().attempts.clone()
    }

    pub fn delivered(&self) -> Vec<(PeerDevice, TxHash)> {
        self.lock().delivered.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, target: PeerDevice, tx: &Transaction) -> Result<Ack, TransportError> {
        let hash = tx.hash();
        let mut script = self.lock();
        script.attempts.push((target, hash));

        if script.always_fail {
            return Err(TransportError::Offline);
        }
        if script.failures_left > 0 {
            script.failures_left -= 1;
            return Err(TransportError::Unreachable(target));
        }
        script.delivered.push((target, hash));
        Ok(Ack { hash })
    }
}
