//! CLI subcommand implementations for bridge-connect.
//!
//! - [`connect`] - pair with a wallet (universal link + QR code)
//! - [`session`] - status, requests and disconnect on the stored session
//!
//! # Usage
//!
//! ```ignore
//! use bridge_connect::{commands, Config};
//!
//! let config = Config::load()?;
//! commands::connect::run(&config, "https://app.example/manifest.json", 300).await?;
//! commands::session::status(&config).await?;
//! ```

pub mod connect;
pub mod session;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::gateway::HttpGatewayFactory;
use crate::protocol::WalletEvent;
use crate::provider::{BridgeProvider, Subscription};
use crate::storage::{FileStorage, Storage};

/// Open the file storage of the config directory.
pub fn open_storage() -> Result<Arc<dyn Storage>> {
    let path = Config::storage_path().context("Failed to locate storage file")?;
    log::debug!("Using storage file {:?}", path);
    Ok(Arc::new(FileStorage::new(path)))
}

/// HTTP gateway factory configured from `config`.
pub fn gateway_factory(config: &Config, storage: &Arc<dyn Storage>) -> Arc<HttpGatewayFactory> {
    Arc::new(HttpGatewayFactory::new(Arc::clone(storage)).options(config.gateway_options()))
}

/// Forward every wallet event into a channel.
pub fn event_channel(
    provider: &BridgeProvider,
) -> (Subscription, mpsc::UnboundedReceiver<WalletEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = provider.listen(move |event| {
        let _ = tx.send(event.clone());
    });
    (subscription, rx)
}
