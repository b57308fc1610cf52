//! Subcommands operating on the stored session.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{event_channel, gateway_factory, open_storage};
use crate::config::Config;
use crate::error::BridgeError;
use crate::protocol::{AppRequest, WalletEvent};
use crate::provider::{BridgeProvider, SessionState};
use crate::storage::BridgeConnectionStorage;

/// Restore the stored session. `None` if nothing is stored.
async fn restore(config: &Config) -> Result<Option<(BridgeProvider, WalletEvent)>> {
    let storage = open_storage()?;
    let factory = gateway_factory(config, &storage);

    let provider = match BridgeProvider::from_storage_with_options(
        Arc::clone(&storage),
        factory,
        config.provider_options(),
    )
    .await
    {
        Ok(provider) => provider,
        Err(BridgeError::NoStoredConnection) => return Ok(None),
        Err(e) => return Err(e).context("Failed to read stored connection"),
    };

    let (subscription, mut events) = event_channel(&provider);
    provider
        .restore_connection()
        .await
        .context("Failed to restore connection")?;
    subscription.unsubscribe();

    // The stored connect event is replayed synchronously before restore returns
    let connect_event = events
        .try_recv()
        .context("Stored connection has no connect event")?;
    Ok(Some((provider, connect_event)))
}

/// Print the stored wallet and session.
pub async fn status(config: &Config) -> Result<()> {
    let Some((provider, connect_event)) = restore(config).await? else {
        println!("Not connected");
        return Ok(());
    };

    let status = provider.status().await?;
    println!(
        "Wallet:  {}",
        connect_event.wallet_address().unwrap_or("<unknown>")
    );
    if let SessionState::Connected {
        session_id,
        wallet_public_key,
    } = &status.session
    {
        println!("Session: {session_id}");
        println!("Peer:    {wallet_public_key}");
    }
    if let Some(bridge) = &status.active_bridge {
        println!("Bridge:  {bridge}");
    }

    let store = BridgeConnectionStorage::new(open_storage()?);
    println!("Next request id: {}", store.get_next_rpc_request_id().await?);

    provider.close_connection().await;
    Ok(())
}

/// Send one request and print the wallet's answer.
pub async fn request(
    config: &Config,
    method: &str,
    params: Vec<String>,
    wait_secs: u64,
) -> Result<()> {
    let Some((provider, _)) = restore(config).await? else {
        bail!("Not connected; run `bridge-connect connect` first");
    };

    let request = AppRequest::new(method, params);
    let response = tokio::time::timeout(
        Duration::from_secs(wait_secs),
        provider.send_request_with(request, || {
            eprintln!("Request sent, waiting for the wallet...");
        }),
    )
    .await
    .with_context(|| format!("No response within {wait_secs}s"))??;

    provider.close_connection().await;
    match response.into_result() {
        Ok(result) => {
            println!("{}", pretty(&result));
            Ok(())
        }
        Err(error) => bail!("Wallet error {}: {}", error.code, error.message),
    }
}

/// Notify the wallet and forget the stored session.
pub async fn disconnect(config: &Config) -> Result<()> {
    match restore(config).await {
        Ok(Some((provider, _))) => {
            provider.disconnect().await;
        }
        Ok(None) => {
            println!("Not connected");
            return Ok(());
        }
        Err(e) => {
            // Unreachable bridge or corrupt record: drop it locally anyway
            log::warn!("Could not restore session before disconnect: {:#}", e);
            BridgeConnectionStorage::new(open_storage()?)
                .remove_connection()
                .await?;
        }
    }
    println!("Disconnected");
    Ok(())
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
