//! Protocol client behavior against scripted gateways and a simulated wallet.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use bridge_connect::storage::BridgeConnectionStorage;
use bridge_connect::{
    AppRequest, BridgeError, BridgeGateway, BridgeProvider, ConnectRequest, ProviderOptions, SessionState,
    Storage, WalletConnectionSource,
};

use common::{
    provider, single_bridge, wait_until, EventLog, MockGateway, MockGatewayFactory,
    SendBehavior, WalletPeer, BRIDGE,
};

const MANIFEST: &str = "https://app.example/tonconnect-manifest.json";

async fn wait_for_session(provider: &BridgeProvider, connected: bool) {
    for _ in 0..200 {
        let status = provider.status().await.unwrap();
        let is_connected = matches!(status.session, SessionState::Connected { .. });
        if is_connected == connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session did not reach connected={connected}");
}

/// Connect and let the wallet approve with event id 1.
async fn connect_wallet(
    provider: &BridgeProvider,
    factory: &MockGatewayFactory,
    wallet: &WalletPeer,
) -> Arc<MockGateway> {
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let gateway = factory.last();
    gateway.deliver(wallet.connect_event(&gateway.session_id, 1));
    wait_for_session(provider, true).await;
    gateway
}

/// Wait for sent message `index`, answer it and return its id.
async fn answer(gateway: &MockGateway, wallet: &WalletPeer, index: usize) -> String {
    wait_until(|| gateway.sent().len() > index).await;
    let request = wallet.open_request(&gateway.session_id, &gateway.sent()[index]);
    let id = request["id"].as_str().unwrap().to_string();
    gateway.deliver(wallet.response(&gateway.session_id, &id, json!(format!("ok-{id}"))));
    id
}

fn store(storage: &Arc<bridge_connect::MemoryStorage>) -> BridgeConnectionStorage {
    BridgeConnectionStorage::new(Arc::clone(storage) as Arc<dyn Storage>)
}

#[tokio::test]
async fn test_connect_returns_link_and_subscribes() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());

    let link = provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let gateway = factory.last();

    assert!(link.starts_with("tc://?v=2&id="), "got {link}");
    assert!(link.contains(&gateway.session_id));
    assert_eq!(gateway.bridge_url(), BRIDGE);
    wait_until(|| gateway.is_registered()).await;

    let status = provider.status().await.unwrap();
    assert!(matches!(status.session, SessionState::Pending { .. }));
    assert_eq!(status.active_bridge.as_deref(), Some(BRIDGE));
}

#[tokio::test]
async fn test_connect_uses_wallet_universal_link() {
    let source = WalletConnectionSource::Http {
        bridge_url: BRIDGE.into(),
        universal_link: Some("https://t.me/wallet?attach=wallet".into()),
    };
    let (provider, _, _) = provider(source, ProviderOptions::default());

    let link = provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    assert!(link.starts_with("https://t.me/wallet?attach=wallet&startattach=tonconnect-v__2-id__"));
}

#[tokio::test]
async fn test_connect_event_persists_record() {
    let (provider, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();

    let gateway = connect_wallet(&provider, &factory, &wallet).await;
    events.wait_len(1).await;

    let event = &events.events()[0];
    assert_eq!(event.event, "connect");
    assert_eq!(event.id, None);
    assert_eq!(event.wallet_address(), Some("0:wallet"));

    let record = store(&storage).get_http_connection().await.unwrap().unwrap();
    assert_eq!(record.session.wallet_public_key, wallet.public_key());
    assert_eq!(record.session.bridge_url, BRIDGE);
    assert_eq!(record.session.session_key_pair.public_key, gateway.session_id);
    assert_eq!(record.last_wallet_event_id, Some(1));
    assert_eq!(record.next_rpc_request_id, 0);
    assert_eq!(
        record.connect_event.payload["items"].as_array().unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_request_ids_continue_from_stored_counter() {
    let (provider, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    let store = store(&storage);
    let mut record = store.get_http_connection().await.unwrap().unwrap();
    record.next_rpc_request_id = 3;
    store.store_connection(&record).await.unwrap();

    let first = tokio::spawn({
        let provider = provider.clone();
        async move {
            provider
                .send_request(AppRequest::new("sendTransaction", vec!["{}".into()]))
                .await
        }
    });
    assert_eq!(answer(&gateway, &wallet, 0).await, "3");
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.id, "3");
    assert_eq!(response.into_result().unwrap(), json!("ok-3"));

    let second = tokio::spawn({
        let provider = provider.clone();
        async move { provider.send_request(AppRequest::new("signData", vec![])).await }
    });
    assert_eq!(answer(&gateway, &wallet, 1).await, "4");
    assert_eq!(second.await.unwrap().unwrap().id, "4");

    assert_eq!(store.get_next_rpc_request_id().await.unwrap(), 5);
    assert_eq!(gateway.sent()[1].topic, "signData");
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_ids() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            provider.send_request(AppRequest::new("ping", vec![])).await
        }));
    }

    let mut ids = Vec::new();
    for index in 0..5 {
        ids.push(answer(&gateway, &wallet, index).await);
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn test_restore_continues_session_after_restart() {
    let (first, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&first, &factory, &wallet).await;
    let session_id = gateway.session_id.clone();

    let pending = tokio::spawn({
        let provider = first.clone();
        async move { provider.send_request(AppRequest::new("ping", vec![])).await }
    });
    assert_eq!(answer(&gateway, &wallet, 0).await, "0");
    pending.await.unwrap().unwrap();
    first.close_connection().await;
    drop(first);

    // Restart: a new provider over the same storage
    let factory = MockGatewayFactory::new();
    let second = BridgeProvider::from_storage(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&factory) as Arc<dyn bridge_connect::GatewayFactory>,
    )
    .await
    .unwrap();
    let events = EventLog::attach(&second);

    second.restore_connection().await.unwrap();
    assert_eq!(events.names(), vec!["connect"]);
    assert_eq!(events.events()[0].id, None);

    let restored = factory.last();
    assert_eq!(restored.session_id, session_id);
    assert_eq!(restored.bridge_url(), BRIDGE);
    assert!(restored.is_registered());

    let pending = tokio::spawn({
        let provider = second.clone();
        async move { provider.send_request(AppRequest::new("ping", vec![])).await }
    });
    assert_eq!(answer(&restored, &wallet, 0).await, "1");
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restore_without_record_is_noop() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    provider.restore_connection().await.unwrap();
    assert!(factory.gateways().is_empty());
    assert_eq!(provider.status().await.unwrap().session, SessionState::None);

    // A pending connection survives a restore with nothing stored
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let before = provider.status().await.unwrap();
    provider.restore_connection().await.unwrap();

    let after = provider.status().await.unwrap();
    assert!(matches!(after.session, SessionState::Pending { .. }));
    assert_eq!(after, before);
    assert_eq!(after.active_bridge.as_deref(), Some(BRIDGE));
    assert_eq!(factory.gateways().len(), 1);
    assert_eq!(factory.last().close_count(), 0);
}

#[tokio::test]
async fn test_bad_universal_link_changes_nothing() {
    let source = WalletConnectionSource::Http {
        bridge_url: BRIDGE.into(),
        universal_link: Some("not a url".into()),
    };
    let (provider, factory, _) = provider(source, ProviderOptions::default());

    let err = provider
        .connect(ConnectRequest::new(MANIFEST))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::InvalidUrl(_)));
    assert!(factory.gateways().is_empty());
    let status = provider.status().await.unwrap();
    assert_eq!(status.session, SessionState::None);
    assert_eq!(status.active_bridge, None);
}

#[tokio::test]
async fn test_new_wallet_connects_over_stored_record() {
    let (provider, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);

    let first_wallet = WalletPeer::new();
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let first = factory.last();
    first.deliver(first_wallet.connect_event(&first.session_id, 10));
    wait_for_session(&provider, true).await;

    // New pairing while the old record is still stored; the new wallet counts from 1
    let second_wallet = WalletPeer::new();
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let second = factory.last();
    second.deliver(second_wallet.connect_event(&second.session_id, 1));
    events.wait_len(2).await;
    wait_for_session(&provider, true).await;

    assert_eq!(events.names(), vec!["connect", "connect"]);
    let SessionState::Connected {
        wallet_public_key, ..
    } = provider.status().await.unwrap().session
    else {
        panic!("expected a connected session");
    };
    assert_eq!(wallet_public_key, second_wallet.public_key());

    let record = store(&storage).get_http_connection().await.unwrap().unwrap();
    assert_eq!(record.session.wallet_public_key, second_wallet.public_key());
    assert_eq!(record.last_wallet_event_id, Some(1));

    // Ordering is enforced again once the new session is confirmed
    second.deliver(second_wallet.event(&second.session_id, "custom", 1));
    second.deliver(second_wallet.event(&second.session_id, "custom", 2));
    events.wait_len(3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(events.names(), vec!["connect", "connect", "custom"]);
    assert_eq!(events.events()[2].payload["seq"], 2);
}

#[tokio::test]
async fn test_restore_registration_failure_is_returned() {
    let (first, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    connect_wallet(&first, &factory, &WalletPeer::new()).await;
    drop(first);

    let factory = MockGatewayFactory::new();
    factory.set_register_error(Some(BridgeError::RegistrationFailed("503".into())));
    let second = BridgeProvider::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        single_bridge(),
        Arc::clone(&factory) as Arc<dyn bridge_connect::GatewayFactory>,
    );
    let events = EventLog::attach(&second);

    let result = second.restore_connection().await;
    assert_eq!(result, Err(BridgeError::RegistrationFailed("503".into())));
    assert_eq!(events.len(), 0);
}

#[tokio::test]
async fn test_from_storage_without_record() {
    let storage: Arc<dyn Storage> = Arc::new(bridge_connect::MemoryStorage::new());
    let result = BridgeProvider::from_storage(storage, MockGatewayFactory::new()).await;
    assert!(matches!(result, Err(BridgeError::NoStoredConnection)));
}

#[tokio::test]
async fn test_restore_unsupported_when_racing() {
    let source = WalletConnectionSource::Racing(vec!["https://a.example".into()]);
    let (provider, _, _) = provider(source, ProviderOptions::default());
    assert_eq!(
        provider.restore_connection().await,
        Err(BridgeError::RestoreUnsupported)
    );
}

#[tokio::test]
async fn test_race_first_delivery_wins() {
    let urls = vec![
        "https://a.example".to_string(),
        "https://b.example".to_string(),
        "https://c.example".to_string(),
    ];
    let (provider, factory, storage) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();

    let link = provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    assert!(link.starts_with("tc://"));

    let gateways = factory.gateways();
    assert_eq!(gateways.len(), 3);
    let session_id = gateways[0].session_id.clone();
    assert!(gateways.iter().all(|g| g.session_id == session_id));
    assert_eq!(provider.status().await.unwrap().pending_gateways, 3);

    gateways[1].deliver(wallet.connect_event(&session_id, 1));
    wait_for_session(&provider, true).await;

    assert_eq!(gateways[0].close_count(), 1);
    assert_eq!(gateways[1].close_count(), 0);
    assert_eq!(gateways[2].close_count(), 1);

    let status = provider.status().await.unwrap();
    assert_eq!(status.active_bridge.as_deref(), Some("https://b.example"));
    assert_eq!(status.pending_gateways, 0);

    let record = store(&storage).get_http_connection().await.unwrap().unwrap();
    assert_eq!(record.session.bridge_url, "https://b.example");

    // Late delivery from a loser is ignored, the winner keeps working
    gateways[0].deliver(wallet.event(&session_id, "late", 2));
    gateways[1].deliver(wallet.event(&session_id, "custom", 3));
    events.wait_len(2).await;
    assert_eq!(events.names(), vec!["connect", "custom"]);
    assert_eq!(gateways[0].close_count(), 1);
}

#[tokio::test]
async fn test_race_simultaneous_deliveries() {
    let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
    let (provider, factory, _) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let gateways = factory.gateways();
    let session_id = gateways[0].session_id.clone();

    gateways[0].deliver(wallet.connect_event(&session_id, 1));
    gateways[1].deliver(wallet.event(&session_id, "custom", 2));
    wait_for_session(&provider, true).await;

    // Make sure the second delivery has been processed too
    gateways[0].deliver(wallet.event(&session_id, "marker", 3));
    events.wait_len(2).await;

    assert_eq!(events.names(), vec!["connect", "marker"]);
    assert_eq!(gateways[0].close_count(), 0);
    assert_eq!(gateways[1].close_count(), 1);
    assert_eq!(
        provider.status().await.unwrap().active_bridge.as_deref(),
        Some("https://a.example")
    );
}

async fn disconnect_with(behavior: SendBehavior) {
    let options = ProviderOptions {
        disconnect_timeout: Duration::from_millis(100),
    };
    let (provider, factory, storage) = provider(single_bridge(), options);
    factory.set_send_behavior(behavior);
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    tokio::time::timeout(Duration::from_secs(2), provider.disconnect())
        .await
        .expect("disconnect must not hang");

    let sent = gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "disconnect");
    let request = wallet.open_request(&gateway.session_id, &sent[0]);
    assert_eq!(request["method"], "disconnect");
    assert_eq!(request["params"], json!([]));

    let status = provider.status().await.unwrap();
    assert_eq!(status.session, SessionState::None);
    assert_eq!(status.active_bridge, None);
    assert_eq!(status.listeners, 1);
    assert_eq!(gateway.close_count(), 1);
    assert_eq!(store(&storage).get_http_connection().await.unwrap(), None);
    assert_eq!(events.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_disconnect_when_send_succeeds() {
    disconnect_with(SendBehavior::Accept).await;
}

#[tokio::test]
async fn test_disconnect_when_send_fails() {
    disconnect_with(SendBehavior::Fail).await;
}

#[tokio::test]
async fn test_disconnect_when_send_hangs() {
    disconnect_with(SendBehavior::Hang).await;
}

#[tokio::test]
async fn test_disconnect_without_session() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    provider.disconnect().await;

    assert!(factory.last().sent().is_empty());
    assert_eq!(factory.last().close_count(), 1);
    assert_eq!(provider.status().await.unwrap().session, SessionState::None);
}

#[tokio::test]
async fn test_duplicate_and_stale_events_are_dropped() {
    let (provider, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;
    let sid = gateway.session_id.clone();

    gateway.deliver(wallet.event(&sid, "custom", 5));
    gateway.deliver(wallet.event(&sid, "custom", 5));
    gateway.deliver(wallet.event(&sid, "custom", 3));
    gateway.deliver(wallet.event(&sid, "custom", 1));
    gateway.deliver(wallet.event(&sid, "custom", 6));
    events.wait_len(3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seqs: Vec<_> = events
        .events()
        .iter()
        .skip(1)
        .map(|e| e.payload["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![5, 6]);
    assert!(events.events().iter().all(|e| e.id.is_none()));
    assert_eq!(
        store(&storage).get_last_wallet_event_id().await.unwrap(),
        Some(6)
    );
}

#[tokio::test]
async fn test_wallet_disconnect_event_tears_down() {
    let (provider, factory, storage) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    gateway.deliver(wallet.event(&gateway.session_id, "disconnect", 2));
    events.wait_len(2).await;

    assert_eq!(events.names(), vec!["connect", "disconnect"]);
    assert_eq!(provider.status().await.unwrap().session, SessionState::None);
    assert_eq!(gateway.close_count(), 1);
    assert_eq!(store(&storage).get_http_connection().await.unwrap(), None);
}

#[tokio::test]
async fn test_connect_error_event_reaches_listeners() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let gateway = factory.last();
    gateway.deliver(wallet.message(
        &gateway.session_id,
        &json!({"event": "connect_error", "id": 1, "payload": {"code": 300, "message": "declined"}}),
    ));
    events.wait_len(1).await;

    let event = &events.events()[0];
    assert_eq!(event.event, "connect_error");
    assert_eq!(event.payload["code"], 300);
    assert!(matches!(
        provider.status().await.unwrap().session,
        SessionState::Pending { .. }
    ));
}

#[tokio::test]
async fn test_send_without_session_fails_fast() {
    let (provider, _, _) = provider(single_bridge(), ProviderOptions::default());
    assert_eq!(
        provider
            .send_request(AppRequest::new("ping", vec![]))
            .await
            .unwrap_err(),
        BridgeError::NoSession
    );

    // A pending connection is not enough
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    let err = provider
        .send_request(AppRequest::new("ping", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::NoSession);
    assert!(err.is_usage_error());
}

#[tokio::test]
async fn test_send_failure_leaves_no_pending_request() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    factory.set_send_behavior(SendBehavior::Fail);
    connect_wallet(&provider, &factory, &WalletPeer::new()).await;

    let sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&sent);
    let err = provider
        .send_request_with(AppRequest::new("ping", vec![]), move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::SendFailed(_)));
    assert!(!sent.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(provider.status().await.unwrap().pending_requests, 0);
}

#[tokio::test]
async fn test_on_sent_fires_before_response() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
    let pending = tokio::spawn({
        let provider = provider.clone();
        async move {
            provider
                .send_request_with(AppRequest::new("ping", vec![]), move || {
                    let _ = sent_tx.send(());
                })
                .await
        }
    });

    sent_rx.await.unwrap();
    assert_eq!(provider.status().await.unwrap().pending_requests, 1);
    answer(&gateway, &wallet, 0).await;
    pending.await.unwrap().unwrap();
    assert_eq!(provider.status().await.unwrap().pending_requests, 0);
}

#[tokio::test]
async fn test_unmatched_response_is_ignored() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;
    let sid = gateway.session_id.clone();

    gateway.deliver(wallet.response(&sid, "42", json!("nobody asked")));
    gateway.deliver(wallet.event(&sid, "custom", 2));
    events.wait_len(2).await;

    assert_eq!(events.names(), vec!["connect", "custom"]);
    assert_eq!(provider.status().await.unwrap().pending_requests, 0);
}

#[tokio::test]
async fn test_undecryptable_message_is_dropped() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let events = EventLog::attach(&provider);
    let wallet = WalletPeer::new();
    let gateway = connect_wallet(&provider, &factory, &wallet).await;

    let mut garbled = wallet.event(&gateway.session_id, "custom", 2);
    garbled.message = "AAAA".into();
    gateway.deliver(garbled);
    let mut impostor = WalletPeer::new().event(&gateway.session_id, "custom", 3);
    impostor.from = wallet.public_key().to_string();
    gateway.deliver(impostor);
    gateway.deliver(wallet.event(&gateway.session_id, "custom", 4));
    events.wait_len(2).await;

    assert_eq!(events.events()[1].payload["seq"], 4);
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_teardown_resolves_in_flight_requests() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let gateway = connect_wallet(&provider, &factory, &WalletPeer::new()).await;

    let pending = tokio::spawn({
        let provider = provider.clone();
        async move { provider.send_request(AppRequest::new("ping", vec![])).await }
    });
    wait_until(|| !gateway.sent().is_empty()).await;

    provider.close_connection().await;
    assert_eq!(
        pending.await.unwrap().unwrap_err(),
        BridgeError::SessionClosed
    );
    let status = provider.status().await.unwrap();
    assert_eq!(status.listeners, 0);
    assert_eq!(status.session, SessionState::None);
}

#[tokio::test]
async fn test_reconnect_closes_previous_session() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    let gateways = factory.gateways();
    assert_eq!(gateways.len(), 2);
    assert_eq!(gateways[0].close_count(), 1);
    assert_eq!(gateways[1].close_count(), 0);
    assert_ne!(gateways[0].session_id, gateways[1].session_id);
}

#[tokio::test]
async fn test_unsubscribed_listener_stops_receiving() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    let kept = EventLog::attach(&provider);
    let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&removed);
    let subscription = provider.listen(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    subscription.unsubscribe();

    let wallet = WalletPeer::new();
    connect_wallet(&provider, &factory, &wallet).await;
    kept.wait_len(1).await;
    assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_dispatch() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    provider.listen(|_| panic!("listener bug"));
    let events = EventLog::attach(&provider);

    connect_wallet(&provider, &factory, &WalletPeer::new()).await;
    events.wait_len(1).await;
    assert!(provider.status().await.is_ok());
}

#[tokio::test]
async fn test_registration_error_is_broadcast() {
    let (provider, factory, _) = provider(single_bridge(), ProviderOptions::default());
    factory.set_register_error(Some(BridgeError::RegistrationFailed("refused".into())));
    let mut errors = provider.errors();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error, BridgeError::RegistrationFailed("refused".into()));
    assert!(error.is_transport_error());
}

#[tokio::test]
async fn test_race_reports_error_once_every_candidate_failed() {
    let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
    let (provider, factory, _) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    let mut errors = provider.errors();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    // One candidate down is not a failure yet
    factory
        .gateway(0)
        .report_error(BridgeError::RegistrationFailed("a refused".into()));
    provider.status().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(errors.try_recv().is_err());

    factory
        .gateway(1)
        .report_error(BridgeError::RegistrationFailed("b refused".into()));
    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    let BridgeError::RegistrationFailed(message) = error else {
        panic!("expected a registration failure");
    };
    assert!(message.contains("all 2 candidate bridges failed"), "got {message}");
    assert!(message.contains("b refused"));

    // Repeated errors from the same candidates are not reported again
    factory.gateway(0).report_error(BridgeError::Closed);
    provider.status().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_race_with_refused_subscriptions_is_reported() {
    let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
    let (provider, factory, _) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    factory.set_register_error(Some(BridgeError::RegistrationFailed("503".into())));
    let mut errors = provider.errors();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(error.is_transport_error());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_race_is_forgotten_by_the_next_connect() {
    let urls = vec!["https://a.example".to_string()];
    let (provider, factory, _) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    let mut errors = provider.errors();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    factory.gateway(0).report_error(BridgeError::Closed);
    tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();

    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();
    factory.gateway(1).report_error(BridgeError::Closed);
    let again = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(again, BridgeError::RegistrationFailed(_)));
}

#[tokio::test]
async fn test_pause_and_unpause_reach_every_gateway() {
    let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
    let (provider, factory, _) =
        provider(WalletConnectionSource::Racing(urls), ProviderOptions::default());
    provider.connect(ConnectRequest::new(MANIFEST)).await.unwrap();

    provider.pause().await;
    provider.unpause().await.unwrap();

    for gateway in factory.gateways() {
        assert_eq!(gateway.pause_count(), 1);
        assert_eq!(gateway.unpause_count(), 1);
    }
}
