//! HTTP bridge gateway.
//!
//! # Protocol
//!
//! ```text
//! subscribe:  GET  {bridge}/events?client_id={session_id}[&last_event_id={id}]
//!             Accept: text/event-stream
//!             data: {"from": "<hex>", "message": "<base64>"}
//!
//! send:       POST {bridge}/message?client_id={session_id}&to={hex}&ttl={secs}&topic={method}
//!             body: base64 ciphertext
//! ```
//!
//! The id of every delivered event is persisted under a per-bridge key (see
//! [`last_event_id_key`]) before the message is handed on, so a
//! re-subscription after a pause, a dropped stream or a restart replays
//! nothing twice and loses nothing the bridge still holds.
//!
//! A dropped stream is re-opened with exponential backoff and jitter until
//! the gateway is paused or closed.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use super::sse::{SseDecoder, SseEvent};
use super::{BridgeGateway, EventSink, GatewayFactory, GatewayId};
use crate::error::BridgeError;
use crate::protocol::BridgeIncomingMessage;
use crate::storage::Storage;

/// Prefix of the storage key holding the last delivered server-sent event id.
pub const LAST_EVENT_ID_STORAGE_KEY: &str = "ton-connect-storage_http-bridge-gateway";

/// Storage key of the event cursor for `bridge_url`.
///
/// Bridges number their events independently, so each keeps its own cursor.
pub fn last_event_id_key(bridge_url: &str) -> String {
    format!(
        "{LAST_EVENT_ID_STORAGE_KEY}:{}",
        bridge_url.trim_end_matches('/')
    )
}

/// Default time-to-live the bridge keeps an undelivered message.
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 300;

/// Reconnection backoff configuration.
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Event name (and data) the bridge uses for keepalives.
const HEARTBEAT: &str = "heartbeat";

/// Tunables shared by all gateways of a factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOptions {
    /// `ttl` sent with every message, in seconds.
    pub message_ttl: u64,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            message_ttl: DEFAULT_MESSAGE_TTL_SECS,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

/// Builds [`HttpBridgeGateway`]s sharing one HTTP client and store.
#[derive(Debug, Clone)]
pub struct HttpGatewayFactory {
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
    options: GatewayOptions,
}

impl HttpGatewayFactory {
    /// Factory with default options.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            client: reqwest::Client::new(),
            storage,
            options: GatewayOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a preconfigured HTTP client.
    #[must_use]
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

impl GatewayFactory for HttpGatewayFactory {
    fn create(
        &self,
        id: GatewayId,
        bridge_url: &str,
        session_id: &str,
        sink: EventSink,
    ) -> Arc<dyn BridgeGateway> {
        Arc::new(HttpBridgeGateway::new(
            id,
            bridge_url,
            session_id,
            self.client.clone(),
            Arc::clone(&self.storage),
            self.options.clone(),
            sink,
        ))
    }
}

/// Immutable part shared with the subscription task.
#[derive(Debug)]
struct GatewayContext {
    id: GatewayId,
    bridge_url: String,
    session_id: String,
    last_event_id_key: String,
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
    options: GatewayOptions,
    sink: EventSink,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    task: Option<JoinHandle<()>>,
    closed: bool,
}

/// Gateway speaking the HTTP bridge protocol.
#[derive(Debug)]
pub struct HttpBridgeGateway {
    ctx: Arc<GatewayContext>,
    state: Mutex<SubscriptionState>,
}

impl HttpBridgeGateway {
    /// Create an unsubscribed gateway.
    pub fn new(
        id: GatewayId,
        bridge_url: &str,
        session_id: &str,
        client: reqwest::Client,
        storage: Arc<dyn Storage>,
        options: GatewayOptions,
        sink: EventSink,
    ) -> Self {
        Self {
            ctx: Arc::new(GatewayContext {
                id,
                bridge_url: bridge_url.to_string(),
                session_id: session_id.to_string(),
                last_event_id_key: last_event_id_key(bridge_url),
                client,
                storage,
                options,
                sink,
            }),
            state: Mutex::new(SubscriptionState::default()),
        }
    }

    fn stop_subscription(&self, close: bool) {
        let task = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.closed |= close;
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

impl Drop for HttpBridgeGateway {
    fn drop(&mut self) {
        self.stop_subscription(true);
    }
}

#[async_trait]
impl BridgeGateway for HttpBridgeGateway {
    fn id(&self) -> GatewayId {
        self.ctx.id
    }

    fn bridge_url(&self) -> &str {
        &self.ctx.bridge_url
    }

    async fn register_session(&self) -> Result<(), BridgeError> {
        let ready_rx = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| BridgeError::RegistrationFailed("gateway state poisoned".into()))?;
            if state.closed {
                return Err(BridgeError::Closed);
            }
            if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
                return Ok(());
            }

            let (ready_tx, ready_rx) = oneshot::channel();
            let ctx = Arc::clone(&self.ctx);
            state.task = Some(tokio::spawn(run_subscription(ctx, ready_tx)));
            ready_rx
        };

        match ready_rx.await {
            Ok(result) => result,
            // Task aborted by pause/close before the stream opened
            Err(_) => Err(BridgeError::Closed),
        }
    }

    async fn send(&self, message: &[u8], receiver: &str, topic: &str) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }

        let mut url = endpoint(&self.ctx.bridge_url, "message")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.ctx.session_id)
            .append_pair("to", receiver)
            .append_pair("ttl", &self.ctx.options.message_ttl.to_string())
            .append_pair("topic", topic);

        log::debug!(
            "[{}] POST message to {}... (topic {topic})",
            self.ctx.id,
            short_key(receiver)
        );

        let response = self
            .ctx
            .client
            .post(url)
            .body(BASE64.encode(message))
            .send()
            .await
            .map_err(|e| BridgeError::SendFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::SendFailed(format!(
                "bridge responded with {status}"
            )));
        }
        Ok(())
    }

    fn pause(&self) {
        log::debug!("[{}] Pausing subscription", self.ctx.id);
        self.stop_subscription(false);
    }

    async fn unpause(&self) -> Result<(), BridgeError> {
        log::debug!("[{}] Resuming subscription", self.ctx.id);
        self.register_session().await
    }

    fn close(&self) {
        if !self.is_closed() {
            log::debug!("[{}] Closing gateway for {}", self.ctx.id, self.ctx.bridge_url);
        }
        self.stop_subscription(true);
    }
}

/// Keep the event stream open until aborted.
///
/// The first connection attempt answers `ready`; if it fails the task ends.
/// Later failures are reported through the sink and retried.
async fn run_subscription(
    ctx: Arc<GatewayContext>,
    ready: oneshot::Sender<Result<(), BridgeError>>,
) {
    let mut ready = Some(ready);
    let mut backoff = ctx.options.initial_backoff;

    loop {
        match open_stream(&ctx).await {
            Ok(response) => {
                log::info!("[{}] Subscribed to {}", ctx.id, ctx.bridge_url);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                backoff = ctx.options.initial_backoff;

                match read_stream(&ctx, response).await {
                    Ok(()) => log::warn!("[{}] Event stream ended", ctx.id),
                    Err(e) => log::warn!("[{}] Event stream failed: {}", ctx.id, e),
                }
            }
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                    return;
                }
                log::warn!("[{}] Resubscribe failed: {}", ctx.id, e);
                if !ctx.sink.report_error(e) {
                    return;
                }
            }
        }

        // Exponential backoff with jitter
        let jitter_ms = rand::random::<u64>() % 1000;
        let wait = backoff + Duration::from_millis(jitter_ms);
        log::info!(
            "[{}] Reconnecting to {} in {:.1}s...",
            ctx.id,
            ctx.bridge_url,
            wait.as_secs_f32()
        );
        tokio::time::sleep(wait).await;
        backoff = (backoff * 2).min(ctx.options.max_backoff);
    }
}

async fn open_stream(ctx: &GatewayContext) -> Result<reqwest::Response, BridgeError> {
    let last_event_id = match ctx.storage.get_item(&ctx.last_event_id_key).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("[{}] Failed to read last event id: {:#}", ctx.id, e);
            None
        }
    };

    let mut url = endpoint(&ctx.bridge_url, "events")
        .map_err(|e| BridgeError::RegistrationFailed(e.to_string()))?;
    url.query_pairs_mut().append_pair("client_id", &ctx.session_id);
    if let Some(last_event_id) = last_event_id {
        url.query_pairs_mut()
            .append_pair("last_event_id", &last_event_id);
    }

    let response = ctx
        .client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| BridgeError::RegistrationFailed(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::RegistrationFailed(format!(
            "bridge responded with {status}"
        )));
    }
    Ok(response)
}

async fn read_stream(
    ctx: &GatewayContext,
    response: reqwest::Response,
) -> Result<(), reqwest::Error> {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        for event in decoder.feed(&chunk?) {
            handle_event(ctx, event).await;
        }
    }
    Ok(())
}

async fn handle_event(ctx: &GatewayContext, event: SseEvent) {
    if event.event == HEARTBEAT || event.data == HEARTBEAT {
        return;
    }

    let message: BridgeIncomingMessage = match serde_json::from_str(&event.data) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[{}] Dropping malformed bridge message: {}", ctx.id, e);
            return;
        }
    };

    if let Some(id) = &event.id {
        if let Err(e) = ctx.storage.set_item(&ctx.last_event_id_key, id).await {
            log::warn!("[{}] Failed to store last event id: {:#}", ctx.id, e);
        }
    }

    log::debug!(
        "[{}] Bridge message from {}...",
        ctx.id,
        short_key(&message.from)
    );
    ctx.sink.deliver(message);
}

/// `{bridge_url}/{path}`, tolerating a trailing slash on the bridge URL.
fn endpoint(bridge_url: &str, path: &str) -> Result<Url, BridgeError> {
    let joined = format!("{}/{path}", bridge_url.trim_end_matches('/'));
    Url::parse(&joined).map_err(|e| BridgeError::InvalidUrl(format!("{joined}: {e}")))
}

fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
