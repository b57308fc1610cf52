//! Error type shared by the provider, gateways and connection store.
//!
//! Variants fall into four groups:
//!
//! - **Usage errors** - an operation was called without the session or
//!   transport state it needs ([`BridgeError::NoSession`],
//!   [`BridgeError::RestoreUnsupported`], [`BridgeError::NoStoredConnection`]).
//!   These are returned immediately and never retried.
//! - **Transport errors** - a gateway failed to subscribe or send. They are
//!   returned to the caller whose operation was in flight, or broadcast on
//!   [`crate::BridgeProvider::errors`] when nobody is waiting.
//! - **Protocol anomalies** - duplicate events, unmatched responses and
//!   undecryptable envelopes. These are logged inside the provider and never
//!   surface as a `BridgeError`.
//! - **Peer-reported errors** - carried inside [`crate::WalletResponse`] and
//!   handed back unchanged.

/// Errors that can occur while talking to a wallet through a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A request was sent before the wallet confirmed the connection.
    NoSession,
    /// `restore_connection` was called on a provider that races several bridges.
    RestoreUnsupported,
    /// No connection record is persisted.
    NoStoredConnection,
    /// Subscribing to the bridge failed.
    RegistrationFailed(String),
    /// Posting a message to the bridge failed.
    SendFailed(String),
    /// The gateway was already closed.
    Closed,
    /// Encrypting an outgoing message failed.
    Encryption(String),
    /// Decrypting an incoming message failed.
    Decryption(String),
    /// A message could not be parsed.
    InvalidMessage(String),
    /// A URL could not be built or parsed.
    InvalidUrl(String),
    /// The storage backend failed.
    Storage(String),
    /// The session was torn down before the wallet answered.
    SessionClosed,
    /// The provider task is no longer running.
    ProviderStopped,
}

impl BridgeError {
    /// Wrap a storage backend error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Returns `true` for errors caused by calling an operation in the wrong state.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NoSession | Self::RestoreUnsupported | Self::NoStoredConnection
        )
    }

    /// Returns `true` for errors raised by the bridge transport.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::RegistrationFailed(_) | Self::SendFailed(_) | Self::Closed
        )
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSession => write!(f, "Trying to send bridge request without session"),
            Self::RestoreUnsupported => write!(
                f,
                "Cannot restore a connection when racing several bridges"
            ),
            Self::NoStoredConnection => write!(f, "No bridge connection is stored"),
            Self::RegistrationFailed(msg) => write!(f, "Bridge registration failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Bridge send failed: {msg}"),
            Self::Closed => write!(f, "Bridge gateway closed"),
            Self::Encryption(msg) => write!(f, "Encryption error: {msg}"),
            Self::Decryption(msg) => write!(f, "Decryption error: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid message: {msg}"),
            Self::InvalidUrl(msg) => write!(f, "Invalid URL: {msg}"),
            Self::Storage(msg) => write!(f, "Storage error: {msg}"),
            Self::SessionClosed => write!(f, "Session closed before the wallet responded"),
            Self::ProviderStopped => write!(f, "Bridge provider stopped"),
        }
    }
}

impl std::error::Error for BridgeError {}
