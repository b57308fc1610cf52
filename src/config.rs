//! Configuration loading and persistence.
//!
//! Settings live in `config.json` inside the config directory, next to the
//! `storage.json` file that holds the connection record. Environment
//! variables override file values:
//!
//! | Variable                              | Field                  |
//! |---------------------------------------|------------------------|
//! | `BRIDGE_CONNECT_CONFIG_DIR`           | config directory       |
//! | `BRIDGE_CONNECT_BRIDGE_URL`           | `bridge_url`           |
//! | `BRIDGE_CONNECT_UNIVERSAL_LINK`       | `universal_link`       |
//! | `BRIDGE_CONNECT_CANDIDATE_BRIDGES`    | `candidate_bridges`    |
//! | `BRIDGE_CONNECT_MESSAGE_TTL`          | `message_ttl`          |
//! | `BRIDGE_CONNECT_DISCONNECT_TIMEOUT_MS`| `disconnect_timeout_ms`|

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::GatewayOptions;
use crate::provider::{ProviderOptions, WalletConnectionSource};

/// Config file name inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Storage file name inside the config directory.
const STORAGE_FILE: &str = "storage.json";

/// Configuration for the bridge-connect CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Bridge used when no candidates are configured.
    pub bridge_url: String,
    /// Wallet universal link. `tc://` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub universal_link: Option<String>,
    /// Bridges raced on connect. Overrides `bridge_url` when non-empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidate_bridges: Vec<String>,
    /// Seconds the bridge keeps an undelivered message.
    pub message_ttl: u64,
    /// Milliseconds `disconnect` waits for the bridge.
    pub disconnect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let gateway = GatewayOptions::default();
        let provider = ProviderOptions::default();
        Self {
            bridge_url: "https://bridge.tonapi.io/bridge".to_string(),
            universal_link: None,
            candidate_bridges: Vec::new(),
            message_ttl: gateway.message_ttl,
            disconnect_timeout_ms: provider.disconnect_timeout.as_millis() as u64,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `BRIDGE_CONNECT_CONFIG_DIR` wins over the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("BRIDGE_CONNECT_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("bridge-connect"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {:?}", dir))?;
        Ok(dir)
    }

    /// Path of the key-value storage file.
    pub fn storage_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(STORAGE_FILE))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`, defaults when the file is missing.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", config_path))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bridge_url) = var("BRIDGE_CONNECT_BRIDGE_URL") {
            self.bridge_url = bridge_url;
        }

        if let Some(universal_link) = var("BRIDGE_CONNECT_UNIVERSAL_LINK") {
            self.universal_link = Some(universal_link).filter(|l| !l.is_empty());
        }

        if let Some(candidates) = var("BRIDGE_CONNECT_CANDIDATE_BRIDGES") {
            self.candidate_bridges = candidates
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(ttl) = var("BRIDGE_CONNECT_MESSAGE_TTL") {
            if let Ok(ttl) = ttl.parse::<u64>() {
                self.message_ttl = ttl;
            }
        }

        if let Some(timeout) = var("BRIDGE_CONNECT_DISCONNECT_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.disconnect_timeout_ms = timeout;
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {:?}", config_path))?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Connection source: racing when candidates are configured.
    pub fn connection_source(&self) -> WalletConnectionSource {
        if self.candidate_bridges.is_empty() {
            WalletConnectionSource::Http {
                bridge_url: self.bridge_url.clone(),
                universal_link: self.universal_link.clone(),
            }
        } else {
            WalletConnectionSource::Racing(self.candidate_bridges.clone())
        }
    }

    /// Gateway tunables.
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            message_ttl: self.message_ttl,
            ..GatewayOptions::default()
        }
    }

    /// Provider tunables.
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
        }
    }
}
