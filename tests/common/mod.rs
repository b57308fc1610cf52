//! Shared test doubles: scripted gateways and a simulated wallet.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_connect::gateway::{BridgeGateway, EventSink, GatewayFactory, GatewayId};
use bridge_connect::{
    BridgeError, BridgeIncomingMessage, BridgeProvider, MemoryStorage, ProviderOptions,
    SessionCrypto, Storage, WalletConnectionSource, WalletEvent,
};

/// How a mock gateway answers `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBehavior {
    Accept,
    Fail,
    Hang,
}

/// One message handed to a mock gateway.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Vec<u8>,
    pub receiver: String,
    pub topic: String,
}

#[derive(Debug)]
pub struct MockGateway {
    id: GatewayId,
    bridge_url: String,
    pub session_id: String,
    sink: EventSink,
    send_behavior: SendBehavior,
    register_error: Option<BridgeError>,
    registered: AtomicBool,
    close_count: AtomicUsize,
    pause_count: AtomicUsize,
    unpause_count: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
}

impl MockGateway {
    /// Push a message as if it came from the bridge.
    pub fn deliver(&self, message: BridgeIncomingMessage) {
        self.sink.deliver(message);
    }

    pub fn report_error(&self, error: BridgeError) {
        self.sink.report_error(error);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn pause_count(&self) -> usize {
        self.pause_count.load(Ordering::SeqCst)
    }

    pub fn unpause_count(&self) -> usize {
        self.unpause_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BridgeGateway for MockGateway {
    fn id(&self) -> GatewayId {
        self.id
    }

    fn bridge_url(&self) -> &str {
        &self.bridge_url
    }

    async fn register_session(&self) -> Result<(), BridgeError> {
        if let Some(error) = &self.register_error {
            return Err(error.clone());
        }
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &[u8], receiver: &str, topic: &str) -> Result<(), BridgeError> {
        self.sent.lock().unwrap().push(SentMessage {
            message: message.to_vec(),
            receiver: receiver.to_string(),
            topic: topic.to_string(),
        });
        match self.send_behavior {
            SendBehavior::Accept => Ok(()),
            SendBehavior::Fail => Err(BridgeError::SendFailed("bridge responded with 500".into())),
            SendBehavior::Hang => std::future::pending().await,
        }
    }

    fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn unpause(&self) -> Result<(), BridgeError> {
        self.unpause_count.fetch_add(1, Ordering::SeqCst);
        self.register_session().await
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory recording every gateway it creates.
#[derive(Debug)]
pub struct MockGatewayFactory {
    gateways: Mutex<Vec<Arc<MockGateway>>>,
    send_behavior: Mutex<SendBehavior>,
    register_error: Mutex<Option<BridgeError>>,
}

impl MockGatewayFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gateways: Mutex::new(Vec::new()),
            send_behavior: Mutex::new(SendBehavior::Accept),
            register_error: Mutex::new(None),
        })
    }

    /// Behavior of gateways created from now on.
    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        *self.send_behavior.lock().unwrap() = behavior;
    }

    pub fn set_register_error(&self, error: Option<BridgeError>) {
        *self.register_error.lock().unwrap() = error;
    }

    pub fn gateways(&self) -> Vec<Arc<MockGateway>> {
        self.gateways.lock().unwrap().clone()
    }

    pub fn gateway(&self, index: usize) -> Arc<MockGateway> {
        Arc::clone(&self.gateways.lock().unwrap()[index])
    }

    pub fn last(&self) -> Arc<MockGateway> {
        Arc::clone(self.gateways.lock().unwrap().last().expect("no gateway created"))
    }
}

impl GatewayFactory for MockGatewayFactory {
    fn create(
        &self,
        id: GatewayId,
        bridge_url: &str,
        session_id: &str,
        sink: EventSink,
    ) -> Arc<dyn BridgeGateway> {
        let gateway = Arc::new(MockGateway {
            id,
            bridge_url: bridge_url.to_string(),
            session_id: session_id.to_string(),
            sink,
            send_behavior: *self.send_behavior.lock().unwrap(),
            register_error: self.register_error.lock().unwrap().clone(),
            registered: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            pause_count: AtomicUsize::new(0),
            unpause_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        });
        self.gateways.lock().unwrap().push(Arc::clone(&gateway));
        gateway
    }
}

/// Simulated wallet holding its own session keys.
#[derive(Debug, Clone)]
pub struct WalletPeer {
    pub crypto: SessionCrypto,
}

impl WalletPeer {
    pub fn new() -> Self {
        Self {
            crypto: SessionCrypto::new(),
        }
    }

    pub fn public_key(&self) -> &str {
        self.crypto.session_id()
    }

    /// Encrypt `payload` for the app session `app_session_id`.
    pub fn message(&self, app_session_id: &str, payload: &Value) -> BridgeIncomingMessage {
        let plaintext = serde_json::to_vec(payload).unwrap();
        let ciphertext = self.crypto.encrypt(&plaintext, app_session_id).unwrap();
        BridgeIncomingMessage {
            from: self.public_key().to_string(),
            message: BASE64.encode(ciphertext),
        }
    }

    pub fn connect_event(&self, app_session_id: &str, id: u64) -> BridgeIncomingMessage {
        self.message(
            app_session_id,
            &json!({
                "event": "connect",
                "id": id,
                "payload": {
                    "items": [
                        {"name": "ton_addr", "address": "0:wallet", "network": "-239"},
                        {"name": "ton_proof", "proof": {"signature": "sig"}}
                    ],
                    "device": {"appName": "mock-wallet"}
                }
            }),
        )
    }

    pub fn event(&self, app_session_id: &str, name: &str, id: u64) -> BridgeIncomingMessage {
        self.message(
            app_session_id,
            &json!({"event": name, "id": id, "payload": {"seq": id}}),
        )
    }

    pub fn response(&self, app_session_id: &str, id: &str, result: Value) -> BridgeIncomingMessage {
        self.message(app_session_id, &json!({"result": result, "id": id}))
    }

    /// Decrypt a request the app sent to this wallet.
    pub fn open_request(&self, app_session_id: &str, sent: &SentMessage) -> Value {
        assert_eq!(sent.receiver, self.public_key());
        let plaintext = self.crypto.decrypt(&sent.message, app_session_id).unwrap();
        serde_json::from_slice(&plaintext).unwrap()
    }
}

/// Records every event a listener receives.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<WalletEvent>>>,
}

impl EventLog {
    pub fn attach(provider: &BridgeProvider) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        provider.listen(move |event| events.lock().unwrap().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<WalletEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub async fn wait_len(&self, n: usize) {
        let log = self.clone();
        wait_until(move || log.len() >= n).await;
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Provider over fresh memory storage and a mock factory.
pub fn provider(
    source: WalletConnectionSource,
    options: ProviderOptions,
) -> (BridgeProvider, Arc<MockGatewayFactory>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let factory = MockGatewayFactory::new();
    let provider = BridgeProvider::with_options(
        Arc::clone(&storage) as Arc<dyn Storage>,
        source,
        Arc::clone(&factory) as Arc<dyn GatewayFactory>,
        options,
    );
    (provider, factory, storage)
}

pub const BRIDGE: &str = "https://bridge.example/bridge";

pub fn single_bridge() -> WalletConnectionSource {
    WalletConnectionSource::http(BRIDGE)
}
