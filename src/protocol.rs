//! Wire types exchanged with the wallet.
//!
//! Everything here travels inside encrypted bridge messages except
//! [`ConnectRequest`], which is embedded in the universal link, and
//! [`BridgeIncomingMessage`], which is the bridge's own envelope.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Protocol version announced in the universal link (`v` parameter).
pub const PROTOCOL_VERSION: u8 = 2;

/// Name of the connect item carrying the wallet address.
pub const TON_ADDR_ITEM: &str = "ton_addr";

/// RPC method the app sends to end the session.
pub const DISCONNECT_METHOD: &str = "disconnect";

/// Connect request embedded in the universal link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// URL of the app manifest the wallet displays.
    pub manifest_url: String,
    /// Items requested from the wallet.
    pub items: Vec<ConnectItem>,
}

impl ConnectRequest {
    /// Request only the wallet address.
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            items: vec![ConnectItem::TonAddress],
        }
    }
}

/// A single item requested at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ConnectItem {
    /// Wallet address.
    #[serde(rename = "ton_addr")]
    TonAddress,
    /// Proof of address ownership over `payload`.
    #[serde(rename = "ton_proof")]
    TonProof {
        /// App-chosen challenge.
        payload: String,
    },
}

/// RPC request sent by the app. The id is assigned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequest {
    /// Method name, also used as the bridge topic.
    pub method: String,
    /// Method parameters, each a JSON-encoded string.
    pub params: Vec<String>,
}

impl AppRequest {
    /// Build a request.
    pub fn new(method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// The `disconnect` request.
    pub fn disconnect() -> Self {
        Self::new(DISCONNECT_METHOD, Vec::new())
    }
}

/// Request as it goes over the wire, with its correlation id.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub method: &'a str,
    pub params: &'a [String],
    pub id: String,
}

/// Error reported by the wallet inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletResponseError {
    /// Wallet-defined error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response to an [`AppRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletResponse {
    /// Id of the request being answered.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Wallet-reported failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WalletResponseError>,
}

impl WalletResponse {
    /// Split into the result or the wallet-reported error.
    pub fn into_result(self) -> Result<Value, WalletResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Kind of a [`WalletEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletEventKind {
    /// Wallet approved the connection.
    Connect,
    /// Wallet rejected the connection.
    ConnectError,
    /// Wallet ended the session.
    Disconnect,
    /// Any other event name.
    Other,
}

/// Unsolicited, ordered notification from the wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEvent {
    /// Event name (`connect`, `connect_error`, `disconnect`, ...).
    pub event: String,
    /// Monotonic event id assigned by the wallet. Stripped before listeners see the event.
    #[serde(
        default,
        deserialize_with = "deserialize_event_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<u64>,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

impl WalletEvent {
    /// Classify the event.
    pub fn kind(&self) -> WalletEventKind {
        match self.event.as_str() {
            "connect" => WalletEventKind::Connect,
            "connect_error" => WalletEventKind::ConnectError,
            "disconnect" => WalletEventKind::Disconnect,
            _ => WalletEventKind::Other,
        }
    }

    /// Copy of the event without its protocol id.
    pub fn without_id(&self) -> Self {
        Self {
            id: None,
            ..self.clone()
        }
    }

    /// Copy of a connect event that keeps only the address item, as persisted.
    pub fn reduced_for_storage(&self) -> Self {
        let mut reduced = self.clone();
        if let Some(items) = reduced.payload.get_mut("items").and_then(Value::as_array_mut) {
            items.retain(|item| item.get("name").and_then(Value::as_str) == Some(TON_ADDR_ITEM));
        }
        reduced
    }

    /// Wallet address from the `ton_addr` item of a connect event.
    pub fn wallet_address(&self) -> Option<&str> {
        self.payload
            .get("items")?
            .as_array()?
            .iter()
            .find(|item| item.get("name").and_then(Value::as_str) == Some(TON_ADDR_ITEM))?
            .get("address")?
            .as_str()
    }
}

/// Decrypted message from the wallet.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletMessage {
    /// Answer to one of our requests.
    Response(WalletResponse),
    /// Unsolicited event.
    Event(WalletEvent),
}

impl WalletMessage {
    /// Parse a decrypted payload. Anything with an `event` field is an event.
    pub fn parse(bytes: &[u8]) -> Result<Self, BridgeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| BridgeError::InvalidMessage(e.to_string()))?;

        if value.get("event").is_some() {
            serde_json::from_value(value)
                .map(Self::Event)
                .map_err(|e| BridgeError::InvalidMessage(format!("event: {e}")))
        } else {
            serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| BridgeError::InvalidMessage(format!("response: {e}")))
        }
    }
}

/// Envelope delivered by a bridge subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeIncomingMessage {
    /// Sender public key (hex).
    pub from: String,
    /// Base64-encoded ciphertext.
    pub message: String,
}

/// Ids arrive as strings from most wallets but as numbers from some.
fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn deserialize_event_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid event id: {n}"))),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid event id: {s}"))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid event id: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_request_serialization() {
        let request = ConnectRequest {
            manifest_url: "https://app.example/manifest.json".into(),
            items: vec![
                ConnectItem::TonAddress,
                ConnectItem::TonProof {
                    payload: "nonce".into(),
                },
            ],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"manifestUrl":"https://app.example/manifest.json","items":[{"name":"ton_addr"},{"name":"ton_proof","payload":"nonce"}]}"#
        );
    }

    #[test]
    fn test_parse_response_with_string_id() {
        let msg = WalletMessage::parse(br#"{"result":"0xabc","id":"7"}"#).unwrap();
        match msg {
            WalletMessage::Response(resp) => {
                assert_eq!(resp.id, "7");
                assert_eq!(resp.into_result().unwrap(), json!("0xabc"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_with_numeric_id_and_error() {
        let msg =
            WalletMessage::parse(br#"{"error":{"code":300,"message":"user declined"},"id":4}"#)
                .unwrap();
        let WalletMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, "4");
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, 300);
        assert_eq!(err.message, "user declined");
    }

    #[test]
    fn test_parse_event() {
        let msg = WalletMessage::parse(br#"{"event":"disconnect","id":12,"payload":{}}"#).unwrap();
        let WalletMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.kind(), WalletEventKind::Disconnect);
        assert_eq!(event.id, Some(12));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(WalletMessage::parse(b"not json").is_err());
        assert!(WalletMessage::parse(br#"{"result":1}"#).is_err());
    }

    #[test]
    fn test_without_id_strips_id() {
        let event = WalletEvent {
            event: "custom".into(),
            id: Some(3),
            payload: json!({"a": 1}),
        };
        let stripped = event.without_id();
        assert_eq!(stripped.id, None);
        assert!(!serde_json::to_string(&stripped).unwrap().contains("\"id\""));
    }

    #[test]
    fn test_reduced_for_storage_keeps_only_address() {
        let event = WalletEvent {
            event: "connect".into(),
            id: Some(1),
            payload: json!({
                "items": [
                    {"name": "ton_addr", "address": "0:abc", "network": "-239"},
                    {"name": "ton_proof", "proof": {"signature": "sig"}}
                ],
                "device": {"appName": "wallet"}
            }),
        };
        let reduced = event.reduced_for_storage();
        let items = reduced.payload["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(reduced.wallet_address(), Some("0:abc"));
        assert_eq!(reduced.payload["device"]["appName"], "wallet");
    }
}
