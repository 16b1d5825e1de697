use super::*;
use crate::transport::SubscriptionHandle;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::AtomicUsize;

/// In-memory transport that records every call
#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Calls>,
}

#[derive(Default)]
struct Calls {
    active: bool,
    activations: usize,
    deactivations: usize,
    connect_headers: BTreeMap<String, String>,
    subscribed: Vec<(String, String)>,
    unsubscribed: Vec<String>,
    next_id: usize,
}

impl RecordingTransport {
    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }

    fn subscribe_count(&self, destination: &str) -> usize {
        self.calls()
            .subscribed
            .iter()
            .filter(|(_, dest)| dest == destination)
            .count()
    }
}

impl Transport for RecordingTransport {
    fn activate(&self, _url: &Url) -> u64 {
        let mut calls = self.calls();
        calls.active = true;
        calls.activations += 1;
        calls.activations as u64
    }

    fn deactivate(&self) {
        let mut calls = self.calls();
        calls.active = false;
        calls.deactivations += 1;
    }

    fn is_active(&self) -> bool {
        self.calls().active
    }

    fn set_connect_headers(&self, headers: BTreeMap<String, String>) {
        self.calls().connect_headers = headers;
    }

    fn subscribe(&self, destination: &str) -> SubscriptionHandle {
        let mut calls = self.calls();
        let id = format!("sub-{}", calls.next_id);
        calls.next_id += 1;
        calls.subscribed.push((id.clone(), destination.to_string()));
        SubscriptionHandle::new(id)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.calls().unsubscribed.push(handle.id().to_string());
    }
}

fn service() -> (RealtimeService, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let config = RealtimeConfig::default().with_api_base_url("http://localhost:8080/api");
    let service = RealtimeService::new(&config, transport.clone()).unwrap();
    (service, transport)
}

fn connected_service() -> (RealtimeService, Arc<RecordingTransport>) {
    let (service, transport) = service();
    service.connect(Some("abc"));
    service.handle_event(connected(1));
    (service, transport)
}

fn connected(generation: u64) -> TransportEvent {
    TransportEvent::Connected { generation }
}

fn dropped(generation: u64, reason: &str) -> TransportEvent {
    TransportEvent::Disconnected {
        generation,
        reason: reason.to_string(),
    }
}

/// Message from the first activation
fn message(destination: &str, body: &str) -> TransportEvent {
    message_in(1, destination, body)
}

fn message_in(generation: u64, destination: &str, body: &str) -> TransportEvent {
    TransportEvent::Message {
        generation,
        destination: destination.to_string(),
        body: Bytes::from(body.to_string()),
    }
}

/// Listener that stores every payload it sees
fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = move |value: &Value| -> anyhow::Result<()> {
        sink.lock().unwrap().push(value.clone());
        Ok(())
    };
    (seen, listener)
}

#[test]
fn test_connect_is_idempotent() {
    let (service, transport) = service();

    service.connect(None);
    service.connect(None);
    assert_eq!(transport.calls().activations, 1);

    // Still a single activation once live
    service.handle_event(connected(1));
    service.connect(Some("refreshed"));
    assert_eq!(transport.calls().activations, 1);
    assert_eq!(
        transport.calls().connect_headers.get("Authorization").map(String::as_str),
        Some("Bearer refreshed")
    );
}

#[test]
fn test_connect_without_base_url_is_noop() {
    let transport = Arc::new(RecordingTransport::default());
    let service = RealtimeService::new(&RealtimeConfig::default(), transport.clone()).unwrap();

    assert!(!service.is_enabled());
    service.connect(Some("abc"));

    assert_eq!(transport.calls().activations, 0);
    assert!(transport.calls().connect_headers.is_empty());
    assert_eq!(service.state(), LinkState::Disconnected);
}

#[test]
fn test_invalid_base_url_is_rejected() {
    let transport = Arc::new(RecordingTransport::default());
    let config = RealtimeConfig::default().with_api_base_url("mailto:ops@rollcall.app");
    assert!(RealtimeService::new(&config, transport).is_err());
}

#[test]
fn test_subscribe_before_connect_opens_one_subscription() {
    let (service, transport) = service();
    let (_seen, listener) = recorder();

    let _sub = service.subscribe("/topic/x", listener).unwrap();
    assert!(transport.calls().subscribed.is_empty());
    assert_eq!(service.state(), LinkState::Disconnected);

    service.connect(None);
    assert_eq!(service.state(), LinkState::Connecting);
    assert!(transport.calls().subscribed.is_empty());

    service.handle_event(connected(1));
    assert_eq!(transport.subscribe_count("/topic/x"), 1);
    assert_eq!(service.active_subscriptions(), vec!["/topic/x".to_string()]);

    // A duplicate connect notification must not double-subscribe
    service.handle_event(connected(1));
    assert_eq!(transport.subscribe_count("/topic/x"), 1);
}

#[test]
fn test_fan_out_to_matching_destination_only() {
    let (service, transport) = connected_service();
    let (seen_a, listener_a) = recorder();
    let (seen_b, listener_b) = recorder();
    let (seen_other, listener_other) = recorder();

    let _a = service.subscribe("/topic/attendance/7", listener_a).unwrap();
    let _b = service.subscribe("/topic/attendance/7", listener_b).unwrap();
    let _c = service.subscribe("/topic/attendance/8", listener_other).unwrap();

    // One protocol subscription per destination
    assert_eq!(transport.subscribe_count("/topic/attendance/7"), 1);
    assert_eq!(transport.subscribe_count("/topic/attendance/8"), 1);

    service.handle_event(message("/topic/attendance/7", r#"{"eventId":7}"#));

    assert_eq!(*seen_a.lock().unwrap(), vec![json!({"eventId": 7})]);
    assert_eq!(*seen_b.lock().unwrap(), vec![json!({"eventId": 7})]);
    assert!(seen_other.lock().unwrap().is_empty());
}

#[test]
fn test_listeners_called_in_registration_order() {
    let (service, _transport) = connected_service();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut subs = Vec::new();
    for n in 0..3 {
        let order = order.clone();
        subs.push(
            service
                .subscribe("/topic/x", move |_: &Value| -> anyhow::Result<()> {
                    order.lock().unwrap().push(n);
                    Ok(())
                })
                .unwrap(),
        );
    }

    service.handle_event(message("/topic/x", "{}"));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_unsubscribe_cleans_up() {
    let (service, transport) = connected_service();
    let (seen, listener) = recorder();

    let sub = service.subscribe("/topic/x", listener).unwrap();
    sub.unsubscribe();

    assert_eq!(service.listener_count("/topic/x"), 0);
    assert!(service.active_subscriptions().is_empty());
    assert_eq!(transport.calls().unsubscribed, vec!["sub-0".to_string()]);

    service.handle_event(message("/topic/x", r#"{"id":1}"#));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_unsubscribe_twice_is_noop() {
    let (service, transport) = connected_service();
    let (_seen, first) = recorder();
    let (_seen2, second) = recorder();

    let a = service.subscribe("/topic/x", first).unwrap();
    let _b = service.subscribe("/topic/x", second).unwrap();

    a.unsubscribe();
    a.unsubscribe();
    a.clone().unsubscribe();

    assert_eq!(service.listener_count("/topic/x"), 1);
    assert!(transport.calls().unsubscribed.is_empty());
}

#[test]
fn test_partial_unsubscribe_keeps_subscription() {
    let (service, transport) = connected_service();
    let (seen_a, listener_a) = recorder();
    let (seen_b, listener_b) = recorder();

    let a = service.subscribe("/topic/x", listener_a).unwrap();
    let _b = service.subscribe("/topic/x", listener_b).unwrap();

    a.unsubscribe();
    assert!(transport.calls().unsubscribed.is_empty());
    assert_eq!(service.active_subscriptions(), vec!["/topic/x".to_string()]);

    service.handle_event(message("/topic/x", "[1]"));
    assert!(seen_a.lock().unwrap().is_empty());
    assert_eq!(*seen_b.lock().unwrap(), vec![json!([1])]);
}

#[test]
fn test_unsubscribe_while_disconnected_sends_nothing() {
    let (service, transport) = service();
    let (_seen, listener) = recorder();

    let sub = service.subscribe("/topic/x", listener).unwrap();
    sub.unsubscribe();

    service.connect(None);
    service.handle_event(connected(1));

    assert!(transport.calls().subscribed.is_empty());
    assert!(transport.calls().unsubscribed.is_empty());
}

#[test]
fn test_reconnect_restores_subscriptions() {
    let (service, transport) = connected_service();
    let (seen, listener) = recorder();
    let _sub = service.subscribe("/topic/notifications/42", listener).unwrap();

    service.handle_event(dropped(1, "network lost"));
    assert_eq!(service.state(), LinkState::Connecting);
    assert!(service.active_subscriptions().is_empty());
    assert_eq!(service.listener_count("/topic/notifications/42"), 1);

    service.handle_event(connected(1));
    assert_eq!(transport.subscribe_count("/topic/notifications/42"), 2);
    assert_eq!(transport.calls().activations, 1);

    service.handle_event(message("/topic/notifications/42", r#"{"id":9}"#));
    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 9})]);
}

#[test]
fn test_disconnect_keeps_listeners_for_next_connect() {
    let (service, transport) = connected_service();
    let (_seen, listener) = recorder();
    let _sub = service.subscribe("/topic/x", listener).unwrap();

    service.disconnect();
    assert_eq!(transport.calls().deactivations, 1);
    assert_eq!(service.state(), LinkState::Disconnected);
    assert!(service.active_subscriptions().is_empty());
    assert_eq!(service.listener_count("/topic/x"), 1);
    // Handles are discarded, not unsubscribed one by one
    assert!(transport.calls().unsubscribed.is_empty());

    // Late events from the old session are harmless
    service.handle_event(dropped(1, "deactivated"));
    service.handle_event(connected(1));
    assert_eq!(service.state(), LinkState::Disconnected);
    assert_eq!(transport.subscribe_count("/topic/x"), 1);

    service.connect(None);
    assert_eq!(transport.calls().activations, 2);
    service.handle_event(connected(2));
    assert_eq!(transport.subscribe_count("/topic/x"), 2);
}

#[test]
fn test_late_events_from_previous_activation_are_ignored() {
    let (service, transport) = connected_service();
    let (seen, listener) = recorder();
    let _a = service.subscribe("/topic/a", listener).unwrap();

    service.disconnect();
    service.connect(Some("new"));
    service.handle_event(connected(2));
    assert_eq!(transport.subscribe_count("/topic/a"), 2);

    // The old session's shutdown notice and queued traffic arrive late
    service.handle_event(dropped(1, "deactivated"));
    service.handle_event(message_in(1, "/topic/a", r#"{"stale":true}"#));
    assert_eq!(service.state(), LinkState::Connected);
    assert_eq!(service.active_subscriptions(), vec!["/topic/a".to_string()]);
    assert!(seen.lock().unwrap().is_empty());

    let (_seen_b, listener_b) = recorder();
    let b = service.subscribe("/topic/b", listener_b).unwrap();
    assert_eq!(transport.subscribe_count("/topic/b"), 1);

    b.unsubscribe();
    assert_eq!(transport.calls().unsubscribed.len(), 1);

    service.handle_event(message_in(2, "/topic/a", r#"{"fresh":true}"#));
    assert_eq!(*seen.lock().unwrap(), vec![json!({"fresh": true})]);
}

#[test]
fn test_queued_messages_dropped_after_disconnect() {
    let (service, _transport) = connected_service();
    let (seen, listener) = recorder();
    let _sub = service.subscribe("/topic/x", listener).unwrap();

    service.disconnect();
    service.handle_event(message("/topic/x", r#"{"id":1}"#));

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(service.listener_count("/topic/x"), 1);
}

#[test]
fn test_malformed_payload_is_isolated() {
    let (service, _transport) = connected_service();
    let (seen_x, listener_x) = recorder();
    let (seen_y, listener_y) = recorder();
    let _x = service.subscribe("/topic/x", listener_x).unwrap();
    let _y = service.subscribe("/topic/y", listener_y).unwrap();

    service.handle_event(message("/topic/x", "{not json"));
    service.handle_event(message("/topic/x", "\"just a string\""));
    service.handle_event(message("/topic/x", r#"{"ok":true}"#));
    service.handle_event(message("/topic/y", r#"{"ok":1}"#));

    assert_eq!(*seen_x.lock().unwrap(), vec![json!({"ok": true})]);
    assert_eq!(*seen_y.lock().unwrap(), vec![json!({"ok": 1})]);
}

#[test]
fn test_failing_listener_does_not_block_siblings() {
    let (service, _transport) = connected_service();
    let (seen, listener) = recorder();

    let _bad = service
        .subscribe("/topic/x", |_: &Value| -> anyhow::Result<()> {
            anyhow::bail!("screen unmounted")
        })
        .unwrap();
    let _panics = service
        .subscribe("/topic/x", |_: &Value| -> anyhow::Result<()> { panic!("render failed") })
        .unwrap();
    let _good = service.subscribe("/topic/x", listener).unwrap();

    service.handle_event(message("/topic/x", "{}"));
    service.handle_event(message("/topic/x", "{}"));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_listener_may_unsubscribe_itself() {
    let (service, transport) = connected_service();
    let service = Arc::new(service);
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));

    let counter = calls.clone();
    let own = slot.clone();
    let sub = service
        .subscribe("/topic/once", move |_: &Value| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        })
        .unwrap();
    *slot.lock().unwrap() = Some(sub);

    service.handle_event(message("/topic/once", "{}"));
    service.handle_event(message("/topic/once", "{}"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls().unsubscribed.len(), 1);
}

#[test]
fn test_empty_destination_rejected() {
    let (service, _transport) = service();
    let (_seen, listener) = recorder();
    let result = service.subscribe("", listener);
    assert_eq!(result.err(), Some(SubscribeError::EmptyDestination));
}

#[test]
fn test_protocol_error_does_not_change_state() {
    let (service, _transport) = connected_service();
    service.handle_event(TransportEvent::ProtocolError {
        message: "Access denied".into(),
    });
    assert!(service.is_connected());
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Ping {
    id: u64,
    is_read: bool,
}

#[test]
fn test_subscribe_json_typed_payload() {
    let (service, _transport) = connected_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let _sub = service
        .subscribe_json("/topic/x", move |ping: Ping| {
            sink.lock().unwrap().push(ping);
            Ok(())
        })
        .unwrap();

    // Wrong shape is a listener error, not a crash
    service.handle_event(message("/topic/x", r#"{"unexpected":true}"#));
    service.handle_event(message("/topic/x", r#"{"id":3,"isRead":true}"#));

    assert_eq!(*seen.lock().unwrap(), vec![Ping { id: 3, is_read: true }]);
}

#[tokio::test]
async fn test_run_pumps_events_in_order() {
    let (service, transport) = service();
    let (seen, listener) = recorder();
    let _sub = service.subscribe("/topic/x", listener).unwrap();
    service.connect(None);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    event_tx.send(connected(1)).unwrap();
    for n in 0..5 {
        event_tx.send(message("/topic/x", &format!("[{}]", n))).unwrap();
    }
    drop(event_tx);

    service.run(event_rx).await;

    assert_eq!(transport.subscribe_count("/topic/x"), 1);
    let expected: Vec<Value> = (0..5).map(|n| json!([n])).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[test]
fn test_notification_scenario() {
    let (service, transport) = service();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (counter, sink) = (calls.clone(), seen.clone());
    let unsubscribe = service
        .subscribe("/topic/notifications/42", move |value: &Value| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().unwrap().push(value.clone());
            Ok(())
        })
        .unwrap();

    service.connect(Some("abc"));
    assert_eq!(
        transport.calls().connect_headers.get("Authorization").map(String::as_str),
        Some("Bearer abc")
    );
    service.handle_event(connected(1));

    service.handle_event(message("/topic/notifications/42", r#"{"id":1,"isRead":false}"#));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 1, "isRead": false})]);

    unsubscribe.unsubscribe();
    service.handle_event(message("/topic/notifications/42", r#"{"id":2,"isRead":false}"#));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
