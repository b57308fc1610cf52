//! Session cryptography for the bridge protocol.
//!
//! Each session owns an ephemeral X25519 keypair. The hex-encoded public key
//! doubles as the session id that the bridge routes on, so a wallet can both
//! address and encrypt to us from the universal link alone.
//!
//! # Wire Format
//!
//! Messages are NaCl boxes (X25519 + XSalsa20-Poly1305), prefixed with the
//! random nonce:
//!
//! ```text
//! [nonce 24B][poly1305 tag 16B][ciphertext]
//! ```
//!
//! Rust guideline compliant 2025-01

use crypto_box::{
    aead::{Aead, AeadCore, Nonce, OsRng},
    PublicKey, SalsaBox, SecretKey,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::BridgeError;

/// Nonce size for XSalsa20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// X25519 key size in bytes.
const KEY_SIZE: usize = 32;

/// Hex-encoded keypair, as persisted inside the connection record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex-encoded secret key.
    pub secret_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Local identity of one bridge session.
#[derive(Clone)]
pub struct SessionCrypto {
    secret_key: SecretKey,
    public_key: PublicKey,
    session_id: String,
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Default for SessionCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCrypto {
    /// Generate a fresh ephemeral identity.
    pub fn new() -> Self {
        Self::from_secret(SecretKey::generate(&mut OsRng))
    }

    /// Restore an identity from a persisted keypair.
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self, BridgeError> {
        let secret = decode_key(&key_pair.secret_key)
            .map_err(|e| BridgeError::InvalidMessage(format!("secret key: {e}")))?;
        let crypto = Self::from_secret(SecretKey::from(secret));

        if !crypto.session_id.eq_ignore_ascii_case(&key_pair.public_key) {
            return Err(BridgeError::InvalidMessage(
                "stored public key does not match secret key".to_string(),
            ));
        }
        Ok(crypto)
    }

    fn from_secret(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        let session_id = hex::encode(public_key.as_bytes());
        Self {
            secret_key,
            public_key,
            session_id,
        }
    }

    /// Session id (hex-encoded public key).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        self.public_key.as_bytes()
    }

    /// Export the keypair for persistence.
    pub fn key_pair(&self) -> KeyPair {
        KeyPair {
            public_key: self.session_id.clone(),
            secret_key: hex::encode(self.secret_key.to_bytes()),
        }
    }

    /// Encrypt `message` for the holder of `receiver_public_key` (hex).
    pub fn encrypt(&self, message: &[u8], receiver_public_key: &str) -> Result<Vec<u8>, BridgeError> {
        let receiver = parse_public_key(receiver_public_key).map_err(BridgeError::Encryption)?;
        let sealed_box = SalsaBox::new(&receiver, &self.secret_key);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);

        let ciphertext = sealed_box
            .encrypt(&nonce, message)
            .map_err(|e| BridgeError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a message produced by the holder of `sender_public_key` (hex).
    pub fn decrypt(&self, message: &[u8], sender_public_key: &str) -> Result<Vec<u8>, BridgeError> {
        if message.len() <= NONCE_SIZE {
            return Err(BridgeError::Decryption(format!(
                "message too short ({} bytes)",
                message.len()
            )));
        }
        let sender = parse_public_key(sender_public_key).map_err(BridgeError::Decryption)?;
        let sealed_box = SalsaBox::new(&sender, &self.secret_key);

        let (nonce, ciphertext) = message.split_at(NONCE_SIZE);
        sealed_box
            .decrypt(Nonce::<SalsaBox>::from_slice(nonce), ciphertext)
            .map_err(|e| BridgeError::Decryption(e.to_string()))
    }
}

fn decode_key(hex_key: &str) -> Result<[u8; KEY_SIZE], String> {
    let bytes = hex::decode(hex_key).map_err(|e| format!("invalid hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected {KEY_SIZE} bytes, got {}", v.len()))
}

fn parse_public_key(hex_key: &str) -> Result<PublicKey, String> {
    decode_key(hex_key)
        .map(PublicKey::from)
        .map_err(|e| format!("public key: {e}"))
}
