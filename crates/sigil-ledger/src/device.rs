use serde::{Deserialize, Serialize};
use sigil_shared::PeerDevice;

/// A participant device of one conversation and how far it has caught up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device: PeerDevice,
    /// Ed25519 identity key the device signs transactions with
    pub public_key: [u8; 32],
    /// Highest canonical sequence number the device has confirmed
    pub last_seen_sequence: u64,
}

impl DeviceRecord {
    pub fn new(device: PeerDevice, public_key: [u8; 32]) -> Self {
        Self {
            device,
            public_key,
            last_seen_sequence: 0,
        }
    }
}
