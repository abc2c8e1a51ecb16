/// Application name
pub const APP_NAME: &str = "Sigil";

/// Version tag bound into every signed transaction digest
pub const TRANSACTION_VERSION: u8 = 1;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum transaction payload size in bytes (256 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 262_144;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_X3DH: &str = "sigil-x3dh-v1";
pub const KDF_CONTEXT_ROOT_RATCHET: &str = "sigil-root-ratchet-v1";
pub const KDF_CONTEXT_MESSAGE_NONCE: &str = "sigil-message-nonce-v1";
pub const KDF_CONTEXT_TRANSACTION: &str = "sigil-transaction-v1";
pub const KDF_CONTEXT_MEMBERSHIP: &str = "sigil-group-membership-v1";

/// Chain-key ratchet input bytes
pub const CHAIN_STEP_MESSAGE_KEY: u8 = 0x01;
pub const CHAIN_STEP_NEXT_CHAIN: u8 = 0x02;
