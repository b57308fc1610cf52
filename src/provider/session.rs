//! Session lifecycle states.

use crate::crypto::SessionCrypto;
use crate::error::BridgeError;
use crate::storage::{BridgeConnectionHttp, StoredSession};

/// Session created by `connect`, before the wallet answered.
#[derive(Debug, Clone)]
pub struct PartialSession {
    /// Local ephemeral identity.
    pub crypto: SessionCrypto,
    /// Bridge in use. Empty while racing several bridges.
    pub bridge_url: String,
}

/// Session confirmed by a wallet `connect` event.
#[derive(Debug, Clone)]
pub struct Session {
    /// Local identity.
    pub crypto: SessionCrypto,
    /// Bridge the wallet answered on.
    pub bridge_url: String,
    /// Wallet public key (hex).
    pub wallet_public_key: String,
}

impl Session {
    /// Rebuild a session from its persisted record.
    pub fn from_record(record: &BridgeConnectionHttp) -> Result<Self, BridgeError> {
        let crypto = SessionCrypto::from_key_pair(&record.session.session_key_pair)
            .map_err(|e| BridgeError::Storage(format!("stored session keys: {e}")))?;
        Ok(Self {
            crypto,
            bridge_url: record.session.bridge_url.clone(),
            wallet_public_key: record.session.wallet_public_key.clone(),
        })
    }

    /// Persisted form.
    pub fn to_stored(&self) -> StoredSession {
        StoredSession {
            session_key_pair: self.crypto.key_pair(),
            wallet_public_key: self.wallet_public_key.clone(),
            bridge_url: self.bridge_url.clone(),
        }
    }
}

/// Either half of the session lifecycle.
///
/// Transitions replace the value: partial, then full, then cleared. The one
/// in-place change is recording the winning bridge on a partial session.
#[derive(Debug, Clone)]
pub enum BridgeSession {
    /// Waiting for the wallet.
    Partial(PartialSession),
    /// Connected.
    Full(Session),
}

impl BridgeSession {
    /// Local identity.
    pub fn crypto(&self) -> &SessionCrypto {
        match self {
            Self::Partial(s) => &s.crypto,
            Self::Full(s) => &s.crypto,
        }
    }

    /// Bridge in use, empty while racing.
    pub fn bridge_url(&self) -> &str {
        match self {
            Self::Partial(s) => &s.bridge_url,
            Self::Full(s) => &s.bridge_url,
        }
    }

    /// The confirmed session, if any.
    pub fn full(&self) -> Option<&Session> {
        match self {
            Self::Full(s) => Some(s),
            Self::Partial(_) => None,
        }
    }

    /// Upgrade with the wallet key carried by its connect event.
    pub fn confirm(self, wallet_public_key: &str) -> Session {
        let (crypto, bridge_url) = match self {
            Self::Partial(s) => (s.crypto, s.bridge_url),
            Self::Full(s) => (s.crypto, s.bridge_url),
        };
        Session {
            crypto,
            bridge_url,
            wallet_public_key: wallet_public_key.to_string(),
        }
    }
}
