//! `connect` subcommand.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use super::{event_channel, gateway_factory, open_storage};
use crate::config::Config;
use crate::protocol::{ConnectRequest, WalletEventKind};
use crate::provider::BridgeProvider;
use crate::qr;
use crate::storage::BridgeConnectionStorage;

/// Largest QR code printed, in terminal cells.
const QR_MAX_WIDTH: u16 = 120;
const QR_MAX_HEIGHT: u16 = 60;

/// Start a session, print the universal link and wait for the wallet.
pub async fn run(config: &Config, manifest_url: &str, wait_secs: u64) -> Result<()> {
    let storage = open_storage()?;
    if let Some(existing) = BridgeConnectionStorage::new(Arc::clone(&storage))
        .get_http_connection()
        .await?
    {
        bail!(
            "Already connected to {}; run `bridge-connect disconnect` first",
            existing.connect_event.wallet_address().unwrap_or("<unknown>")
        );
    }

    let provider = BridgeProvider::with_options(
        Arc::clone(&storage),
        config.connection_source(),
        gateway_factory(config, &storage),
        config.provider_options(),
    );

    let (_subscription, mut events) = event_channel(&provider);
    let mut errors = provider.errors();

    let link = provider.connect(ConnectRequest::new(manifest_url)).await?;
    println!("Open this link in your wallet:\n\n{link}\n");
    match qr::render_lines(&link, QR_MAX_WIDTH, QR_MAX_HEIGHT) {
        Some(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        None => println!("(link too long to show as a QR code)"),
    }

    let deadline = tokio::time::sleep(Duration::from_secs(wait_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event.kind() {
                WalletEventKind::Connect => {
                    let address = event.wallet_address().unwrap_or("<unknown>");
                    println!("Connected: {address}");
                    return Ok(());
                }
                WalletEventKind::ConnectError => {
                    provider.close_connection().await;
                    bail!("Wallet rejected the connection: {}", event.payload);
                }
                _ => log::debug!("Ignoring {} event while connecting", event.event),
            },
            Ok(error) = errors.recv() => {
                log::warn!("Bridge error while waiting for the wallet: {}", error);
                eprintln!("Bridge error: {error}");
            }
            () = &mut deadline => {
                provider.close_connection().await;
                bail!("No answer from the wallet within {wait_secs}s");
            }
        }
    }
}
