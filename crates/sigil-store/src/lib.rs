//! # sigil-store
//!
//! Persistence boundary for the Sigil core.
//!
//! The core only needs get / put / delete by key and an ordered range scan
//! by key prefix (every conversation, session or queue keeps its records
//! under a common prefix). [`KeyValueStore`] captures exactly that; the
//! crate ships an in-memory backend for tests and ephemeral runs and a
//! SQLite-backed [`Database`].

pub mod database;
pub mod kv;
pub mod memory;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use kv::KeyValueStore;
pub use memory::MemoryStore;
