//! Key-value storage and the bridge connection store built on top of it.
//!
//! # Architecture
//!
//! ```text
//! BridgeConnectionStorage      (connection record, request ids, event ids)
//!     │
//!     └── Storage (trait)
//!         ├── MemoryStorage    (tests, short-lived hosts)
//!         └── FileStorage      (single JSON file, owner-only permissions)
//! ```
//!
//! The HTTP gateway also keeps the last server-sent event id in the same
//! `Storage` so a resumed subscription continues where it left off.

pub mod connection;
pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

/// Durable string key-value store.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read a value, `None` if absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;
}

pub use connection::{
    BridgeConnectionHttp, BridgeConnectionStorage, ConnectionKind, StoredSession,
    CONNECTION_STORAGE_KEY,
};
pub use file::FileStorage;
pub use memory::MemoryStorage;
