//! Bridge provider: the protocol client.
//!
//! Owns the session lifecycle, the pending-request table, the race across
//! candidate bridges, event ordering and teardown.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  Command   ┌──────────────────────────────────────┐
//! │ BridgeProvider │──────────▶ │           PROVIDER ACTOR             │
//! │ (clone freely) │◀── reply ──│                                      │
//! └────────────────┘            │  session / pending table / listeners │
//!                               │  active gateway + pending gateways   │
//!        errors() ◀── broadcast │                                      │
//!                               └──────▲───────────────────▲───────────┘
//!                                      │ GatewayEvent      │ Completion
//!                               ┌──────┴───────┐    ┌──────┴──────────┐
//!                               │ gateways     │    │ send/register   │
//!                               │ (EventSink)  │    │ tasks           │
//!                               └──────────────┘    └─────────────────┘
//! ```
//!
//! All state lives in one task and is touched by one message at a time, so
//! no lock guards any of it. Network work (subscribing, posting) runs in
//! spawned tasks that report back as completions.
//!
//! # Usage
//!
//! ```ignore
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//! let factory = Arc::new(HttpGatewayFactory::new(Arc::clone(&storage)));
//! let provider = BridgeProvider::new(
//!     storage,
//!     WalletConnectionSource::http("https://bridge.example/bridge"),
//!     factory,
//! );
//!
//! let subscription = provider.listen(|event| println!("{}", event.event));
//! let link = provider.connect(ConnectRequest::new(manifest_url)).await?;
//! // show `link`, wait for the connect event ...
//! let response = provider.send_request(AppRequest::new("sendTransaction", params)).await?;
//! provider.disconnect().await;
//! ```
//!
//! Rust guideline compliant 2025-01

mod actor;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::BridgeError;
use crate::gateway::GatewayFactory;
use crate::protocol::{AppRequest, ConnectRequest, WalletEvent, WalletResponse};
use crate::storage::{BridgeConnectionStorage, Storage};

use actor::{Command, ProviderActor};

/// Default time `disconnect` waits for the bridge to accept the notification.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the error broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Callback invoked for every accepted wallet event.
pub type WalletEventListener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// Callback invoked once the bridge accepted an outgoing request.
pub type OnRequestSent = Box<dyn FnOnce() + Send>;

/// Where the wallet is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletConnectionSource {
    /// A single known bridge.
    Http {
        /// Bridge base URL.
        bridge_url: String,
        /// Wallet universal link, `tc://` when absent.
        universal_link: Option<String>,
    },
    /// Several candidate bridges raced on connect. The first one to deliver
    /// a message wins.
    Racing(Vec<String>),
}

impl WalletConnectionSource {
    /// Single bridge without a wallet-specific universal link.
    pub fn http(bridge_url: impl Into<String>) -> Self {
        Self::Http {
            bridge_url: bridge_url.into(),
            universal_link: None,
        }
    }

    /// Returns `true` when several bridges are raced.
    pub fn is_racing(&self) -> bool {
        matches!(self, Self::Racing(_))
    }
}

/// Provider tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Upper bound on waiting for the disconnect notification to be accepted.
    pub disconnect_timeout: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

/// Session state reported by [`BridgeProvider::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    None,
    /// Waiting for the wallet to connect.
    Pending {
        /// Local session id.
        session_id: String,
    },
    /// Wallet connected.
    Connected {
        /// Local session id.
        session_id: String,
        /// Wallet public key (hex).
        wallet_public_key: String,
    },
}

/// Snapshot of the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    /// Session lifecycle state.
    pub session: SessionState,
    /// Bridge of the active gateway.
    pub active_bridge: Option<String>,
    /// Gateways still racing.
    pub pending_gateways: usize,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Registered listeners.
    pub listeners: usize,
}

/// Handle returned by [`BridgeProvider::listen`].
///
/// Dropping it keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl Subscription {
    /// Remove the listener.
    pub fn unsubscribe(self) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(Command::Unlisten { id: self.id });
        }
    }
}

/// Cloneable handle to a running provider.
///
/// Must be created inside a Tokio runtime. The provider task stops once
/// every handle is dropped.
#[derive(Clone, Debug)]
pub struct BridgeProvider {
    tx: mpsc::UnboundedSender<Command>,
    errors: broadcast::Sender<BridgeError>,
    next_listener_id: Arc<AtomicU64>,
    source: Arc<WalletConnectionSource>,
}

impl BridgeProvider {
    /// Start a provider with default options.
    pub fn new(
        storage: Arc<dyn Storage>,
        source: WalletConnectionSource,
        factory: Arc<dyn GatewayFactory>,
    ) -> Self {
        Self::with_options(storage, source, factory, ProviderOptions::default())
    }

    /// Start a provider.
    pub fn with_options(
        storage: Arc<dyn Storage>,
        source: WalletConnectionSource,
        factory: Arc<dyn GatewayFactory>,
        options: ProviderOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let actor = ProviderActor::new(
            BridgeConnectionStorage::new(storage),
            source.clone(),
            factory,
            options,
            errors.clone(),
            rx,
        );
        tokio::spawn(actor.run());

        Self {
            tx,
            errors,
            next_listener_id: Arc::new(AtomicU64::new(0)),
            source: Arc::new(source),
        }
    }

    /// Start a single-bridge provider for the persisted connection.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::NoStoredConnection` if nothing is persisted, or
    /// `BridgeError::Storage` if the record cannot be read.
    pub async fn from_storage(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn GatewayFactory>,
    ) -> Result<Self, BridgeError> {
        Self::from_storage_with_options(storage, factory, ProviderOptions::default()).await
    }

    /// [`from_storage`](Self::from_storage) with explicit options.
    pub async fn from_storage_with_options(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn GatewayFactory>,
        options: ProviderOptions,
    ) -> Result<Self, BridgeError> {
        let record = BridgeConnectionStorage::new(Arc::clone(&storage))
            .get_http_connection()
            .await?
            .ok_or(BridgeError::NoStoredConnection)?;

        let source = WalletConnectionSource::http(record.session.bridge_url);
        Ok(Self::with_options(storage, source, factory, options))
    }

    /// Connection source this provider was built with.
    pub fn source(&self) -> &WalletConnectionSource {
        &self.source
    }

    /// Start a new session and return the universal link for the wallet.
    ///
    /// Any previous session's gateways are closed and its pending requests
    /// fail with `BridgeError::SessionClosed`. The call does not wait for the
    /// wallet; its answer arrives as a `connect` (or `connect_error`) event.
    ///
    /// If the universal link cannot be built, nothing changes and
    /// `BridgeError::InvalidUrl` is returned.
    pub async fn connect(&self, request: ConnectRequest) -> Result<String, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { request, reply }, rx).await?
    }

    /// Resume the persisted session, if any, and replay its connect event.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::RestoreUnsupported` for racing providers, or the
    /// gateway's error if re-subscribing fails.
    pub async fn restore_connection(&self) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Restore { reply }, rx).await?
    }

    /// Send a request and wait for the wallet's response.
    ///
    /// Wallet-reported failures come back inside the response; see
    /// [`WalletResponse::into_result`].
    pub async fn send_request(&self, request: AppRequest) -> Result<WalletResponse, BridgeError> {
        self.send_request_inner(request, None).await
    }

    /// [`send_request`](Self::send_request), calling `on_sent` once the bridge
    /// accepted the message.
    pub async fn send_request_with(
        &self,
        request: AppRequest,
        on_sent: impl FnOnce() + Send + 'static,
    ) -> Result<WalletResponse, BridgeError> {
        self.send_request_inner(request, Some(Box::new(on_sent))).await
    }

    async fn send_request_inner(
        &self,
        request: AppRequest,
        on_sent: Option<OnRequestSent>,
    ) -> Result<WalletResponse, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SendRequest {
                request,
                on_sent,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Notify the wallet and tear the session down.
    ///
    /// Local state and the persisted record are cleared whether the
    /// notification is accepted, fails, or times out. Listeners stay.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if let Err(e) = self.request(Command::Disconnect { reply }, rx).await {
            log::debug!("Disconnect on stopped provider: {}", e);
        }
    }

    /// Drop the session and all listeners without touching storage.
    pub async fn close_connection(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::CloseConnection { reply }, rx).await;
    }

    /// Suspend every gateway.
    pub async fn pause(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::Pause { reply }, rx).await;
    }

    /// Resume every gateway.
    pub async fn unpause(&self) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Unpause { reply }, rx).await?
    }

    /// Snapshot of the provider state.
    pub async fn status(&self) -> Result<ProviderStatus, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Status { reply }, rx).await
    }

    /// Register a wallet event listener.
    pub fn listen(&self, listener: impl Fn(&WalletEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Command::Listen {
            id,
            listener: Arc::new(listener),
        });
        Subscription {
            id,
            tx: self.tx.downgrade(),
        }
    }

    /// Transport errors reported outside of any caller's operation.
    pub fn errors(&self) -> broadcast::Receiver<BridgeError> {
        self.errors.subscribe()
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, BridgeError> {
        self.tx
            .send(command)
            .map_err(|_| BridgeError::ProviderStopped)?;
        rx.await.map_err(|_| BridgeError::ProviderStopped)
    }
}
