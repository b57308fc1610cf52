//! Provider actor: the single owner of session state.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::session::{BridgeSession, PartialSession, Session};
use super::{
    OnRequestSent, ProviderOptions, ProviderStatus, SessionState, WalletConnectionSource,
    WalletEventListener,
};
use crate::crypto::SessionCrypto;
use crate::error::BridgeError;
use crate::gateway::{
    BridgeGateway, EventSink, GatewayEvent, GatewayEventKind, GatewayFactory, GatewayId,
};
use crate::link::{generate_universal_link, STANDARD_UNIVERSAL_LINK};
use crate::protocol::{
    AppRequest, BridgeIncomingMessage, ConnectRequest, OutgoingRequest, WalletEvent,
    WalletEventKind, WalletMessage, WalletResponse, DISCONNECT_METHOD,
};
use crate::storage::{BridgeConnectionHttp, BridgeConnectionStorage};

type ResponseSender = oneshot::Sender<Result<WalletResponse, BridgeError>>;

/// Caller requests.
pub(crate) enum Command {
    Connect {
        request: ConnectRequest,
        reply: oneshot::Sender<Result<String, BridgeError>>,
    },
    Restore {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    SendRequest {
        request: AppRequest,
        on_sent: Option<OnRequestSent>,
        reply: ResponseSender,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    CloseConnection {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Unpause {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Status {
        reply: oneshot::Sender<ProviderStatus>,
    },
    Listen {
        id: u64,
        listener: WalletEventListener,
    },
    Unlisten {
        id: u64,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { request, .. } => f
                .debug_struct("Connect")
                .field("manifest_url", &request.manifest_url)
                .finish_non_exhaustive(),
            Self::Restore { .. } => write!(f, "Restore"),
            Self::SendRequest { request, .. } => f
                .debug_struct("SendRequest")
                .field("method", &request.method)
                .finish_non_exhaustive(),
            Self::Disconnect { .. } => write!(f, "Disconnect"),
            Self::CloseConnection { .. } => write!(f, "CloseConnection"),
            Self::Pause { .. } => write!(f, "Pause"),
            Self::Unpause { .. } => write!(f, "Unpause"),
            Self::Status { .. } => write!(f, "Status"),
            Self::Listen { id, .. } => f.debug_struct("Listen").field("id", id).finish(),
            Self::Unlisten { id } => f.debug_struct("Unlisten").field("id", id).finish(),
        }
    }
}

/// Results of work spawned off the actor.
enum Completion {
    /// A request was handed to the bridge (or not).
    Sent {
        epoch: u64,
        id: u64,
        result: Result<(), BridgeError>,
        on_sent: Option<OnRequestSent>,
    },
    /// The disconnect notification finished, failed or timed out.
    DisconnectSent {
        epoch: u64,
        reply: oneshot::Sender<()>,
    },
    /// A restored gateway finished subscribing.
    Restored {
        epoch: u64,
        result: Result<(), BridgeError>,
        connect_event: WalletEvent,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
}

enum Next {
    Command(Option<Command>),
    Completion(Completion),
    Gateway(GatewayEvent),
}

pub(crate) struct ProviderActor {
    store: BridgeConnectionStorage,
    source: WalletConnectionSource,
    factory: Arc<dyn GatewayFactory>,
    options: ProviderOptions,
    errors: broadcast::Sender<BridgeError>,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
    events_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,

    session: Option<BridgeSession>,
    gateway: Option<Arc<dyn BridgeGateway>>,
    pending_gateways: Vec<Arc<dyn BridgeGateway>>,
    failed_candidates: BTreeSet<GatewayId>,
    pending_requests: BTreeMap<u64, ResponseSender>,
    listeners: Vec<(u64, WalletEventListener)>,

    next_gateway_id: u64,
    // Bumped on every session change so late completions can be recognized.
    epoch: u64,
}

impl ProviderActor {
    pub(crate) fn new(
        store: BridgeConnectionStorage,
        source: WalletConnectionSource,
        factory: Arc<dyn GatewayFactory>,
        options: ProviderOptions,
        errors: broadcast::Sender<BridgeError>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store,
            source,
            factory,
            options,
            errors,
            commands,
            events_tx,
            events_rx,
            completions_tx,
            completions_rx,
            session: None,
            gateway: None,
            pending_gateways: Vec::new(),
            failed_candidates: BTreeSet::new(),
            pending_requests: BTreeMap::new(),
            listeners: Vec::new(),
            next_gateway_id: 0,
            epoch: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                command = self.commands.recv() => Next::Command(command),
                Some(done) = self.completions_rx.recv() => Next::Completion(done),
                Some(event) = self.events_rx.recv() => Next::Gateway(event),
            };

            match next {
                Next::Command(Some(command)) => self.handle_command(command).await,
                Next::Command(None) => break,
                Next::Completion(done) => self.handle_completion(done).await,
                Next::Gateway(event) => self.handle_gateway_event(event).await,
            }
        }

        log::debug!("All provider handles dropped, shutting down");
        self.close_gateways(None);
        self.fail_pending_requests();
    }

    async fn handle_command(&mut self, command: Command) {
        log::trace!("Provider command: {:?}", command);
        match command {
            Command::Connect { request, reply } => {
                let _ = reply.send(self.connect(&request));
            }
            Command::Restore { reply } => self.restore_connection(reply).await,
            Command::SendRequest {
                request,
                on_sent,
                reply,
            } => self.send_request(request, on_sent, reply).await,
            Command::Disconnect { reply } => self.disconnect(reply).await,
            Command::CloseConnection { reply } => {
                self.close_connection();
                let _ = reply.send(());
            }
            Command::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            Command::Unpause { reply } => self.unpause(reply),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Listen { id, listener } => self.listeners.push((id, listener)),
            Command::Unlisten { id } => self.listeners.retain(|(lid, _)| *lid != id),
        }
    }

    // ------------------------------------------------------------------
    // Connection establishment
    // ------------------------------------------------------------------

    fn connect(&mut self, request: &ConnectRequest) -> Result<String, BridgeError> {
        let crypto = SessionCrypto::new();
        let session_id = crypto.session_id().to_string();

        // Build the link before touching any state so a bad link changes nothing
        let universal_link = match &self.source {
            WalletConnectionSource::Http {
                universal_link: Some(link),
                ..
            } => link.as_str(),
            _ => STANDARD_UNIVERSAL_LINK,
        };
        let link = generate_universal_link(universal_link, &session_id, request)?;

        self.reset_session_state();

        let bridge_url = match self.source.clone() {
            WalletConnectionSource::Racing(bridge_urls) => {
                log::info!(
                    "Racing {} bridges for session {}...",
                    bridge_urls.len(),
                    short(&session_id)
                );
                for url in &bridge_urls {
                    let gateway = self.create_gateway(url, &session_id);
                    spawn_registration(Arc::clone(&gateway), self.sink_for(gateway.id()));
                    self.pending_gateways.push(gateway);
                }
                String::new()
            }
            WalletConnectionSource::Http { bridge_url, .. } => {
                log::info!(
                    "Connecting through {} with session {}...",
                    bridge_url,
                    short(&session_id)
                );
                let gateway = self.create_gateway(&bridge_url, &session_id);
                spawn_registration(Arc::clone(&gateway), self.sink_for(gateway.id()));
                self.gateway = Some(gateway);
                bridge_url
            }
        };

        self.session = Some(BridgeSession::Partial(PartialSession { crypto, bridge_url }));
        Ok(link)
    }

    async fn restore_connection(&mut self, reply: oneshot::Sender<Result<(), BridgeError>>) {
        let WalletConnectionSource::Http { bridge_url, .. } = self.source.clone() else {
            let _ = reply.send(Err(BridgeError::RestoreUnsupported));
            return;
        };

        let record = match self.store.get_http_connection().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("No stored connection to restore");
                let _ = reply.send(Ok(()));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let session = match Session::from_record(&record) {
            Ok(session) => session,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.reset_session_state();

        let session_id = session.crypto.session_id().to_string();
        log::info!(
            "Restoring session {}... with wallet {}...",
            short(&session_id),
            short(&session.wallet_public_key)
        );

        let gateway = self.create_gateway(&bridge_url, &session_id);
        self.gateway = Some(Arc::clone(&gateway));
        self.session = Some(BridgeSession::Full(session));

        let epoch = self.epoch;
        let completions = self.completions_tx.clone();
        let connect_event = record.connect_event;
        tokio::spawn(async move {
            let result = gateway.register_session().await;
            let _ = completions.send(Completion::Restored {
                epoch,
                result,
                connect_event,
                reply,
            });
        });
    }

    // ------------------------------------------------------------------
    // Outbound requests
    // ------------------------------------------------------------------

    async fn send_request(
        &mut self,
        request: AppRequest,
        on_sent: Option<OnRequestSent>,
        reply: ResponseSender,
    ) {
        let prepared = match self.prepare_request(&request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let (id, gateway, wallet_public_key, encrypted) = prepared;

        log::debug!("Send bridge request {} (id {})", request.method, id);
        self.pending_requests.insert(id, reply);

        let epoch = self.epoch;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = gateway
                .send(&encrypted, &wallet_public_key, &request.method)
                .await;
            let _ = completions.send(Completion::Sent {
                epoch,
                id,
                result,
                on_sent,
            });
        });
    }

    /// Allocate an id and encrypt the request for the connected wallet.
    async fn prepare_request(
        &mut self,
        request: &AppRequest,
    ) -> Result<(u64, Arc<dyn BridgeGateway>, String, Vec<u8>), BridgeError> {
        let (Some(gateway), Some(session)) = (
            self.gateway.clone(),
            self.session.as_ref().and_then(BridgeSession::full).cloned(),
        ) else {
            return Err(BridgeError::NoSession);
        };

        let id = self.store.take_next_rpc_request_id().await?;
        let payload = serde_json::to_vec(&OutgoingRequest {
            method: &request.method,
            params: &request.params,
            id: id.to_string(),
        })
        .map_err(|e| BridgeError::Encryption(e.to_string()))?;

        let encrypted = session
            .crypto
            .encrypt(&payload, &session.wallet_public_key)?;
        Ok((id, gateway, session.wallet_public_key, encrypted))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn disconnect(&mut self, reply: oneshot::Sender<()>) {
        let prepared = match self.prepare_request(&AppRequest::disconnect()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                log::debug!("Disconnect notification not sent: {}", e);
                self.remove_bridge_and_session().await;
                let _ = reply.send(());
                return;
            }
        };
        let (id, gateway, wallet_public_key, encrypted) = prepared;
        log::info!("Sending disconnect to wallet {}...", short(&wallet_public_key));

        let epoch = self.epoch;
        let timeout = self.options.disconnect_timeout;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let send = gateway.send(&encrypted, &wallet_public_key, DISCONNECT_METHOD);
            match tokio::time::timeout(timeout, send).await {
                Ok(Ok(())) => log::debug!("Disconnect request {} accepted", id),
                Ok(Err(e)) => log::debug!("Disconnect request {} failed: {}", id, e),
                Err(_) => log::debug!(
                    "Disconnect request {} not accepted within {:?}",
                    id,
                    timeout
                ),
            }
            let _ = completions.send(Completion::DisconnectSent { epoch, reply });
        });
    }

    /// Tear down everything and erase the persisted record. Listeners stay.
    async fn remove_bridge_and_session(&mut self) {
        self.reset_session_state();
        if let Err(e) = self.store.remove_connection().await {
            log::error!("Failed to remove stored connection: {}", e);
        }
    }

    fn close_connection(&mut self) {
        self.reset_session_state();
        self.listeners.clear();
    }

    /// Close gateways, drop the session and fail in-flight requests.
    fn reset_session_state(&mut self) {
        self.close_gateways(None);
        self.session = None;
        self.fail_pending_requests();
        self.epoch += 1;
    }

    fn close_gateways(&mut self, except: Option<GatewayId>) {
        if let Some(gateway) = self.gateway.take() {
            gateway.close();
        }
        for gateway in self.pending_gateways.drain(..) {
            if Some(gateway.id()) != except {
                gateway.close();
            }
        }
        self.failed_candidates.clear();
    }

    fn fail_pending_requests(&mut self) {
        for (id, reply) in std::mem::take(&mut self.pending_requests) {
            log::debug!("Request {} abandoned by session teardown", id);
            let _ = reply.send(Err(BridgeError::SessionClosed));
        }
    }

    // ------------------------------------------------------------------
    // Pause
    // ------------------------------------------------------------------

    fn pause(&self) {
        for gateway in self.all_gateways() {
            gateway.pause();
        }
    }

    fn unpause(&self, reply: oneshot::Sender<Result<(), BridgeError>>) {
        let gateways = self.all_gateways();
        tokio::spawn(async move {
            let results =
                futures_util::future::join_all(gateways.iter().map(|g| g.unpause())).await;
            let _ = reply.send(results.into_iter().collect());
        });
    }

    fn all_gateways(&self) -> Vec<Arc<dyn BridgeGateway>> {
        self.gateway
            .iter()
            .chain(self.pending_gateways.iter())
            .cloned()
            .collect()
    }

    fn status(&self) -> ProviderStatus {
        let session = match &self.session {
            None => SessionState::None,
            Some(BridgeSession::Partial(s)) => SessionState::Pending {
                session_id: s.crypto.session_id().to_string(),
            },
            Some(BridgeSession::Full(s)) => SessionState::Connected {
                session_id: s.crypto.session_id().to_string(),
                wallet_public_key: s.wallet_public_key.clone(),
            },
        };
        ProviderStatus {
            session,
            active_bridge: self.gateway.as_ref().map(|g| g.bridge_url().to_string()),
            pending_gateways: self.pending_gateways.len(),
            pending_requests: self.pending_requests.len(),
            listeners: self.listeners.len(),
        }
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    async fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Sent {
                epoch,
                id,
                result,
                on_sent,
            } => match result {
                Ok(()) => {
                    if let Some(on_sent) = on_sent {
                        on_sent();
                    }
                }
                Err(e) => {
                    log::warn!("Request {} was not accepted by the bridge: {}", id, e);
                    if epoch == self.epoch {
                        if let Some(reply) = self.pending_requests.remove(&id) {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            },
            Completion::DisconnectSent { epoch, reply } => {
                if epoch == self.epoch {
                    self.remove_bridge_and_session().await;
                } else {
                    log::debug!("Session changed while disconnecting, nothing to tear down");
                }
                let _ = reply.send(());
            }
            Completion::Restored {
                epoch,
                result,
                connect_event,
                reply,
            } => {
                if epoch != self.epoch {
                    let _ = reply.send(Err(BridgeError::SessionClosed));
                    return;
                }
                match result {
                    Ok(()) => {
                        log::info!("Stored connection restored");
                        let listeners = self.snapshot_listeners();
                        dispatch(&listeners, &connect_event.without_id());
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        log::warn!("Failed to resubscribe restored session: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_gateway_event(&mut self, event: GatewayEvent) {
        let is_active = self.gateway.as_ref().is_some_and(|g| g.id() == event.gateway);
        let is_pending = self.pending_gateways.iter().any(|g| g.id() == event.gateway);

        match event.kind {
            GatewayEventKind::Message(message) => {
                if is_active {
                    self.handle_message(message).await;
                } else if is_pending {
                    self.promote(event.gateway);
                    self.handle_message(message).await;
                } else {
                    log::debug!("Ignoring message from closed {}", event.gateway);
                }
            }
            GatewayEventKind::Error(error) => {
                if is_active {
                    log::warn!("Bridge error on {}: {}", event.gateway, error);
                    let _ = self.errors.send(error);
                } else if is_pending {
                    log::warn!("Candidate bridge {} failed: {}", event.gateway, error);
                    self.candidate_failed(event.gateway, &error);
                } else {
                    log::trace!("Ignoring error from closed {}: {}", event.gateway, error);
                }
            }
        }
    }

    /// Report the race as lost once every candidate has failed.
    fn candidate_failed(&mut self, gateway: GatewayId, error: &BridgeError) {
        let newly_failed = self.failed_candidates.insert(gateway);
        let all_failed = self
            .pending_gateways
            .iter()
            .all(|g| self.failed_candidates.contains(&g.id()));
        if newly_failed && all_failed {
            log::error!("All {} candidate bridges failed", self.pending_gateways.len());
            let _ = self.errors.send(BridgeError::RegistrationFailed(format!(
                "all {} candidate bridges failed, last: {}",
                self.pending_gateways.len(),
                error
            )));
        }
    }

    /// First delivery of a race: keep `winner`, close every other candidate.
    fn promote(&mut self, winner: GatewayId) {
        let Some(pos) = self.pending_gateways.iter().position(|g| g.id() == winner) else {
            return;
        };
        let gateway = self.pending_gateways.remove(pos);
        self.close_gateways(Some(winner));

        log::info!("Bridge {} won the race", gateway.bridge_url());
        if let Some(BridgeSession::Partial(session)) = &mut self.session {
            session.bridge_url = gateway.bridge_url().to_string();
        }
        self.gateway = Some(gateway);
    }

    async fn handle_message(&mut self, message: BridgeIncomingMessage) {
        let Some(session) = &self.session else {
            log::debug!("Dropping bridge message without a session");
            return;
        };

        let wallet_message = match decrypt_message(session.crypto(), &message) {
            Ok(wallet_message) => wallet_message,
            Err(e) => {
                log::warn!(
                    "Dropping undecodable message from {}...: {}",
                    short(&message.from),
                    e
                );
                return;
            }
        };

        match wallet_message {
            WalletMessage::Response(response) => self.handle_response(response),
            WalletMessage::Event(event) => self.handle_event(event, &message.from).await,
        }
    }

    fn handle_response(&mut self, response: WalletResponse) {
        let reply = response
            .id
            .parse::<u64>()
            .ok()
            .and_then(|id| self.pending_requests.remove(&id));

        match reply {
            Some(reply) => {
                log::debug!("Wallet response for request {}", response.id);
                let _ = reply.send(Ok(response));
            }
            None => log::debug!("Response id {} doesn't match any request", response.id),
        }
    }

    async fn handle_event(&mut self, event: WalletEvent, from: &str) {
        let kind = event.kind();
        // A stored record belongs to an earlier session until this one connects
        let confirmed = self.session.as_ref().is_some_and(|s| s.full().is_some());

        if let Some(id) = event.id.filter(|_| confirmed) {
            let last = match self.store.get_last_wallet_event_id().await {
                Ok(last) => last,
                Err(e) => {
                    log::warn!("Failed to read last wallet event id: {}", e);
                    None
                }
            };
            if let Some(last) = last.filter(|last| id <= *last) {
                log::error!(
                    "Received event id (={}) must be greater than stored last wallet event id (={})",
                    id,
                    last
                );
                return;
            }

            if kind != WalletEventKind::Connect {
                if let Err(e) = self.store.store_last_wallet_event_id(id).await {
                    log::warn!("Failed to store last wallet event id: {}", e);
                }
            }
        }

        log::debug!("Wallet event {} (id {:?})", event.event, event.id);
        let listeners = self.snapshot_listeners();

        match kind {
            WalletEventKind::Connect => self.update_session(&event, from).await,
            WalletEventKind::Disconnect => {
                log::info!("Wallet ended the session");
                self.remove_bridge_and_session().await;
            }
            WalletEventKind::ConnectError | WalletEventKind::Other => {}
        }

        dispatch(&listeners, &event.without_id());
    }

    async fn update_session(&mut self, connect_event: &WalletEvent, wallet_public_key: &str) {
        let Some(current) = self.session.take() else {
            return;
        };
        let session = current.confirm(wallet_public_key);
        log::info!(
            "Wallet {}... connected through {}",
            short(wallet_public_key),
            session.bridge_url
        );

        let record = BridgeConnectionHttp::new(session.to_stored(), connect_event);
        self.session = Some(BridgeSession::Full(session));

        if let Err(e) = self.store.store_connection(&record).await {
            log::error!("Failed to store connection: {}", e);
            let _ = self.errors.send(e);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn create_gateway(&mut self, bridge_url: &str, session_id: &str) -> Arc<dyn BridgeGateway> {
        self.next_gateway_id += 1;
        let id = GatewayId(self.next_gateway_id);
        self.factory
            .create(id, bridge_url, session_id, self.sink_for(id))
    }

    fn sink_for(&self, id: GatewayId) -> EventSink {
        EventSink::new(id, self.events_tx.clone())
    }

    fn snapshot_listeners(&self) -> Vec<WalletEventListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Subscribe in the background; failures come back through the sink.
fn spawn_registration(gateway: Arc<dyn BridgeGateway>, sink: EventSink) {
    tokio::spawn(async move {
        if let Err(e) = gateway.register_session().await {
            sink.report_error(e);
        }
    });
}

fn decrypt_message(
    crypto: &SessionCrypto,
    message: &BridgeIncomingMessage,
) -> Result<WalletMessage, BridgeError> {
    let ciphertext = BASE64
        .decode(&message.message)
        .map_err(|e| BridgeError::InvalidMessage(format!("base64: {e}")))?;
    let plaintext = crypto.decrypt(&ciphertext, &message.from)?;
    WalletMessage::parse(&plaintext)
}

fn dispatch(listeners: &[WalletEventListener], event: &WalletEvent) {
    for listener in listeners {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            log::error!("Wallet event listener panicked on {}", event.event);
        }
    }
}

fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
