//! Relay transport abstraction.
//!
//! A gateway is bound to one bridge URL and one session id. It keeps an
//! inbound subscription alive and offers a send primitive; everything it
//! receives, including transport failures, is pushed into an [`EventSink`]
//! owned by the provider.
//!
//! # Architecture
//!
//! ```text
//! BridgeProvider (actor)
//!     │  GatewayFactory::create(id, bridge_url, session_id, sink)
//!     ▼
//! BridgeGateway (trait)
//!     ├── HttpBridgeGateway   (SSE subscription + HTTP POST)
//!     └── test doubles
//!     │
//!     └──► EventSink ──► GatewayEvent { gateway, Message | Error } ──► actor
//! ```
//!
//! Events are tagged with the [`GatewayId`] of their source, so rebinding a
//! gateway after a race is a routing decision inside the provider rather than
//! a callback swap on the gateway.
//!
//! Rust guideline compliant 2025-01

pub mod http;
pub mod sse;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::protocol::BridgeIncomingMessage;

pub use http::{GatewayOptions, HttpBridgeGateway, HttpGatewayFactory};

/// Provider-assigned identity of a gateway instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(pub u64);

impl std::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway#{}", self.0)
    }
}

/// What a gateway reports.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEventKind {
    /// A message arrived on the subscription.
    Message(BridgeIncomingMessage),
    /// The transport failed outside of any caller's operation.
    Error(BridgeError),
}

/// Event tagged with its source gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    /// Source gateway.
    pub gateway: GatewayId,
    /// Payload.
    pub kind: GatewayEventKind,
}

/// Sending half handed to a gateway at creation.
#[derive(Debug, Clone)]
pub struct EventSink {
    gateway: GatewayId,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl EventSink {
    /// Bind a channel to a gateway id.
    pub fn new(gateway: GatewayId, tx: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self { gateway, tx }
    }

    /// Gateway this sink tags events with.
    pub fn gateway(&self) -> GatewayId {
        self.gateway
    }

    /// Push an inbound message. Returns `false` once the provider is gone.
    pub fn deliver(&self, message: BridgeIncomingMessage) -> bool {
        self.push(GatewayEventKind::Message(message))
    }

    /// Push a transport error. Returns `false` once the provider is gone.
    pub fn report_error(&self, error: BridgeError) -> bool {
        self.push(GatewayEventKind::Error(error))
    }

    fn push(&self, kind: GatewayEventKind) -> bool {
        self.tx
            .send(GatewayEvent {
                gateway: self.gateway,
                kind,
            })
            .is_ok()
    }
}

/// Live subscription and send channel for one bridge.
#[async_trait]
pub trait BridgeGateway: Send + Sync + std::fmt::Debug {
    /// Identity assigned by the provider.
    fn id(&self) -> GatewayId;

    /// Bridge this gateway talks to.
    fn bridge_url(&self) -> &str;

    /// Open the inbound subscription.
    ///
    /// Calling this on an already subscribed gateway is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::RegistrationFailed` if the bridge refuses or
    /// cannot be reached, or `BridgeError::Closed` after [`close`](Self::close).
    async fn register_session(&self) -> Result<(), BridgeError>;

    /// Post an encrypted message to `receiver` (hex public key).
    ///
    /// Resolves once the bridge has accepted the message.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::SendFailed` on transport failure, or
    /// `BridgeError::Closed` after [`close`](Self::close).
    async fn send(&self, message: &[u8], receiver: &str, topic: &str) -> Result<(), BridgeError>;

    /// Suspend the subscription. Messages keep queuing on the bridge.
    fn pause(&self);

    /// Resume a paused subscription from the last seen event.
    ///
    /// # Errors
    ///
    /// Same as [`register_session`](Self::register_session).
    async fn unpause(&self) -> Result<(), BridgeError>;

    /// Tear the subscription down for good. Idempotent.
    fn close(&self);
}

/// Creates gateways for the provider.
pub trait GatewayFactory: Send + Sync + std::fmt::Debug {
    /// Build an unsubscribed gateway.
    fn create(
        &self,
        id: GatewayId,
        bridge_url: &str,
        session_id: &str,
        sink: EventSink,
    ) -> Arc<dyn BridgeGateway>;
}
