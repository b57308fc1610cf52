//! Bridge Connect - encrypted wallet sessions over an HTTP bridge.
//!
//! This crate implements the client side of a wallet connection protocol:
//! an application pairs with a remote wallet through a relay ("bridge") that
//! only ever sees ciphertext, sends it RPC requests and receives ordered
//! events, and resumes the session after a restart without re-pairing.
//!
//! # Architecture
//!
//! - **Provider** - protocol client actor: sessions, request correlation,
//!   bridge racing, event ordering, teardown
//! - **Gateway** - one subscription + send channel per bridge URL
//! - **Storage** - key-value persistence and the connection record
//! - **Crypto** - per-session NaCl box identity
//! - **Link** - universal link generation (including Telegram start params)
//!
//! # Modules
//!
//! - [`provider`] - [`BridgeProvider`] and its options
//! - [`gateway`] - [`BridgeGateway`] trait and the HTTP implementation
//! - [`storage`] - [`Storage`] trait, backends and [`BridgeConnectionStorage`]
//! - [`config`] - configuration loading/saving for the CLI
//! - [`commands`] - CLI subcommand implementations

pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod link;
pub mod protocol;
pub mod provider;
pub mod qr;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use crypto::{KeyPair, SessionCrypto};
pub use error::BridgeError;
pub use gateway::{BridgeGateway, EventSink, GatewayFactory, GatewayId, HttpGatewayFactory};
pub use link::{add_return_strategy, generate_universal_link, is_telegram_url};
pub use protocol::{
    AppRequest, BridgeIncomingMessage, ConnectItem, ConnectRequest, WalletEvent,
    WalletEventKind, WalletResponse,
};
pub use provider::{
    BridgeProvider, ProviderOptions, ProviderStatus, SessionState, Subscription,
    WalletConnectionSource,
};
pub use storage::{BridgeConnectionStorage, FileStorage, MemoryStorage, Storage};
