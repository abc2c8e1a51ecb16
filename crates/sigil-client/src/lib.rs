//! # sigil-client
//!
//! Device-side messaging core. The [`LedgerManager`] ties the encryption
//! engine, the per-conversation ledger and the delivery queue together:
//!
//! - **Outgoing**: seal for every recipient device, sign on the current tip,
//!   append locally, then transmit or queue.
//! - **Incoming**: order first, decrypt second. Only canonical transactions
//!   are ever opened.
//! - **Withdrawal**: cancels pending delivery and tombstones the message
//!   while history stays intact.

pub mod conversation;
pub mod manager;
pub mod message;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use conversation::{Conversation, ConversationKind, Participant, SentRecord};
pub use error::ClientError;
pub use manager::{LedgerManager, ManagerOptions};
pub use message::{Content, DecryptedMessage, IncomingOutcome, IncomingReport, TransmissionHandle};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// defaults. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "sigil_client=debug,sigil_ledger=debug,sigil_session=info,sigil_net=info,sigil_store=info,warn",
        )
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
