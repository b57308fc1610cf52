//! Persisted bridge connection record.
//!
//! At most one connection is stored at a time, under
//! [`CONNECTION_STORAGE_KEY`]. The record carries the session keys, the
//! wallet's reduced connect event and two counters: the id for the next
//! outgoing request and the id of the last accepted wallet event.
//!
//! Every read-modify-write goes through one async mutex shared by all clones
//! of a [`BridgeConnectionStorage`], so two concurrent callers can never be
//! handed the same request id.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Storage;
use crate::crypto::KeyPair;
use crate::error::BridgeError;
use crate::protocol::WalletEvent;

/// Storage key of the connection record.
pub const CONNECTION_STORAGE_KEY: &str = "ton-connect-storage_bridge-connection";

/// Transport of a stored connection. Only HTTP bridges exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// HTTP bridge.
    Http,
}

/// Session as persisted: keys, peer and bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    /// Local keypair (hex).
    pub session_key_pair: KeyPair,
    /// Wallet public key (hex).
    pub wallet_public_key: String,
    /// Bridge the session lives on.
    pub bridge_url: String,
}

/// The persisted connection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConnectionHttp {
    /// Always [`ConnectionKind::Http`].
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    /// Session keys and addressing.
    pub session: StoredSession,
    /// Id of the last accepted wallet event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_wallet_event_id: Option<u64>,
    /// Connect event, reduced to the address item.
    pub connect_event: WalletEvent,
    /// Id the next outgoing request will use.
    #[serde(default)]
    pub next_rpc_request_id: u64,
}

impl BridgeConnectionHttp {
    /// Record for a freshly confirmed connection.
    pub fn new(session: StoredSession, connect_event: &WalletEvent) -> Self {
        Self {
            kind: ConnectionKind::Http,
            session,
            last_wallet_event_id: connect_event.id,
            connect_event: connect_event.reduced_for_storage(),
            next_rpc_request_id: 0,
        }
    }
}

/// Typed access to the connection record.
#[derive(Debug, Clone)]
pub struct BridgeConnectionStorage {
    storage: Arc<dyn Storage>,
    lock: Arc<Mutex<()>>,
}

impl BridgeConnectionStorage {
    /// Wrap a key-value store.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the stored connection.
    pub async fn store_connection(
        &self,
        connection: &BridgeConnectionHttp,
    ) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        self.write(connection).await
    }

    /// Erase the stored connection.
    pub async fn remove_connection(&self) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        self.storage
            .remove_item(CONNECTION_STORAGE_KEY)
            .await
            .map_err(BridgeError::storage)
    }

    /// The stored connection, if any.
    pub async fn get_http_connection(&self) -> Result<Option<BridgeConnectionHttp>, BridgeError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Id the next request will use, `0` without a stored connection.
    pub async fn get_next_rpc_request_id(&self) -> Result<u64, BridgeError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read()
            .await?
            .map(|c| c.next_rpc_request_id)
            .unwrap_or(0))
    }

    /// Advance the request counter by one.
    pub async fn increase_next_rpc_request_id(&self) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        if let Some(mut connection) = self.read().await? {
            connection.next_rpc_request_id += 1;
            self.write(&connection).await?;
        }
        Ok(())
    }

    /// Read the next request id and advance the counter in one step.
    ///
    /// Without a stored connection this returns `0` and persists nothing.
    pub async fn take_next_rpc_request_id(&self) -> Result<u64, BridgeError> {
        let _guard = self.lock.lock().await;
        match self.read().await? {
            Some(mut connection) => {
                let id = connection.next_rpc_request_id;
                connection.next_rpc_request_id += 1;
                self.write(&connection).await?;
                Ok(id)
            }
            None => {
                log::debug!("No stored connection, request id counter starts at 0");
                Ok(0)
            }
        }
    }

    /// Id of the last accepted wallet event.
    pub async fn get_last_wallet_event_id(&self) -> Result<Option<u64>, BridgeError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.and_then(|c| c.last_wallet_event_id))
    }

    /// Record an accepted wallet event id. Never moves the stored id backwards.
    pub async fn store_last_wallet_event_id(&self, id: u64) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        if let Some(mut connection) = self.read().await? {
            if connection.last_wallet_event_id.is_some_and(|last| last >= id) {
                return Ok(());
            }
            connection.last_wallet_event_id = Some(id);
            self.write(&connection).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<BridgeConnectionHttp>, BridgeError> {
        let Some(raw) = self
            .storage
            .get_item(CONNECTION_STORAGE_KEY)
            .await
            .map_err(BridgeError::storage)?
        else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BridgeError::Storage(format!("corrupt connection record: {e}")))
    }

    async fn write(&self, connection: &BridgeConnectionHttp) -> Result<(), BridgeError> {
        let raw = serde_json::to_string(connection).map_err(BridgeError::storage)?;
        self.storage
            .set_item(CONNECTION_STORAGE_KEY, &raw)
            .await
            .map_err(BridgeError::storage)
    }
}
