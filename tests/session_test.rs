//! Session lifecycle tests
//!
//! Two sessions negotiate through the in-memory relay and transport.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use common::{offer, wait_until, within};
use relaylink::network::mock::{MemoryRelay, MemoryTransport};
use relaylink::network::{
    ClientId, ConnectionState, DataChannel, HandshakeMessage, NetworkError, PollConfig, Session,
    SessionConfig,
};

const WAIT: Duration = Duration::from_secs(5);

type Inbox = Arc<Mutex<Vec<Value>>>;

fn fast_config() -> SessionConfig {
    SessionConfig {
        ice_servers: Vec::new(),
        poll: PollConfig {
            initial_delay: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

fn session(transport: &MemoryTransport, relay: &Arc<MemoryRelay>, config: SessionConfig) -> Session {
    Session::new(config, Arc::new(transport.clone()), relay.clone())
}

fn collector(inbox: &Inbox) -> impl Fn(Value) + Send + Sync + 'static {
    let inbox = inbox.clone();
    move |payload| inbox.lock().push(payload)
}

/// Host "A" and join "B" on a shared transport, waiting for both to open
async fn connected_pair(
    transport: &MemoryTransport,
    relay: &Arc<MemoryRelay>,
    config: SessionConfig,
) -> (Session, Inbox, Session, Inbox) {
    relay.pair("A", "B");
    let (a_inbox, b_inbox) = (Inbox::default(), Inbox::default());

    let mut a = session(transport, relay, config.clone());
    let mut b = session(transport, relay, config);
    let a_ready = a.host("A", collector(&a_inbox)).expect("host");
    let b_ready = b.join("B", collector(&b_inbox)).expect("join");

    within(WAIT, a_ready.wait()).await.expect("host ready");
    within(WAIT, b_ready.wait()).await.expect("join ready");
    (a, a_inbox, b, b_inbox)
}

/// Test: Sending before any connection
/// Then the send fails with ChannelNotOpen and nothing changes
#[tokio::test]
async fn test_send_before_connect() {
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let s = session(&MemoryTransport::new(), &relay, fast_config());

    let err = assert_err!(s.send(&json!({"text": "hi"})).await);
    assert!(matches!(err, NetworkError::ChannelNotOpen));
    assert_eq!(s.state(), ConnectionState::NotCalled);
}

/// Test: Disconnect without a connection
/// Then disconnect fails and the state is untouched
#[tokio::test]
async fn test_disconnect_when_not_open() {
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let mut s = session(&MemoryTransport::new(), &relay, fast_config());

    let err = assert_err!(s.disconnect().await);
    assert!(matches!(err, NetworkError::NotOpenCannotDisconnect));
    assert!(err.is_misuse());
    assert_eq!(s.state(), ConnectionState::NotCalled);

    let _ready = assert_ok!(s.join("B", |_| {}));
    let err = s.disconnect().await.unwrap_err();
    assert!(matches!(err, NetworkError::NotOpenCannotDisconnect));
    assert_eq!(s.state(), ConnectionState::Initializing);
}

/// Test: Starting twice while negotiating
/// Given a host waiting for an answer
/// When host or join is called again
/// Then both fail with AlreadyInitializing
#[tokio::test]
async fn test_start_while_initializing() {
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let mut s = session(&MemoryTransport::new(), &relay, fast_config());

    let _ready = s.host("A", |_| {}).unwrap();
    assert_eq!(s.state(), ConnectionState::Initializing);
    assert_eq!(s.client_id(), Some(&ClientId::from("A")));

    assert!(matches!(s.host("A", |_| {}), Err(NetworkError::AlreadyInitializing)));
    assert!(matches!(s.join("A", |_| {}), Err(NetworkError::AlreadyInitializing)));
    assert_eq!(s.state(), ConnectionState::Initializing);
}

/// Test: End-to-end exchange
/// Given A hosts and B joins through the relay
/// Then both channels open and payloads flow both ways
#[tokio::test]
async fn test_host_and_join_exchange_payloads() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (a, a_inbox, b, b_inbox) = connected_pair(&transport, &relay, fast_config()).await;

    assert_eq!(a.state(), ConnectionState::Open);
    assert_eq!(b.state(), ConnectionState::Open);

    assert_ok!(a.send(&json!({"text": "hi"})).await);
    assert_ok!(b.send(&json!({"text": "hello", "n": 2})).await);
    wait_until(WAIT, || !b_inbox.lock().is_empty() && !a_inbox.lock().is_empty()).await;

    assert_eq!(*b_inbox.lock(), vec![json!({"text": "hi"})]);
    assert_eq!(*a_inbox.lock(), vec![json!({"text": "hello", "n": 2})]);
}

/// Test: Frames arrive in send order
#[tokio::test]
async fn test_payloads_keep_order() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (a, _a_inbox, _b, b_inbox) = connected_pair(&transport, &relay, fast_config()).await;

    for n in 0..20 {
        a.send(&json!({ "n": n })).await.unwrap();
    }
    wait_until(WAIT, || b_inbox.lock().len() == 20).await;

    let received: Vec<i64> = b_inbox
        .lock()
        .iter()
        .map(|v| v["n"].as_i64().unwrap())
        .collect();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}

/// Test: Handshake traffic through the relay
/// Then the host posts an offer, the joiner an answer, and each side's
/// candidate reaches the other endpoint
#[tokio::test]
async fn test_handshake_messages_and_candidates() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let config = SessionConfig {
        stop_polling_on_open: false,
        ..fast_config()
    };
    let (_a, _, _b, _) = connected_pair(&transport, &relay, config).await;

    let from_a = relay.posted_by(&ClientId::from("A"));
    let from_b = relay.posted_by(&ClientId::from("B"));
    assert!(matches!(from_a[0], HandshakeMessage::Offer { .. }));
    assert!(matches!(from_b[0], HandshakeMessage::Answer { .. }));
    assert!(from_a.iter().any(|m| matches!(m, HandshakeMessage::IceCandidate { .. })));
    assert!(from_b.iter().any(|m| matches!(m, HandshakeMessage::IceCandidate { .. })));

    let endpoints = transport.endpoints();
    assert_eq!(endpoints.len(), 2);
    wait_until(WAIT, || {
        endpoints
            .iter()
            .all(|endpoint| endpoint.remote_candidates().len() == 1)
    })
    .await;
}

/// Test: Polling stops once the channel is open
#[tokio::test]
async fn test_polling_stops_after_open() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (_a, _, _b, _) = connected_pair(&transport, &relay, fast_config()).await;

    let (a_id, b_id) = (ClientId::from("A"), ClientId::from("B"));
    let before = (relay.fetch_count(&a_id), relay.fetch_count(&b_id));
    assert!(before.0 > 0 && before.1 > 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!((relay.fetch_count(&a_id), relay.fetch_count(&b_id)), before);
}

/// Test: Starting an open session
/// Then host and join fail with AlreadyOpen
#[tokio::test]
async fn test_start_while_open() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (mut a, _, mut b, _) = connected_pair(&transport, &relay, fast_config()).await;

    assert!(matches!(a.host("A", |_| {}), Err(NetworkError::AlreadyOpen)));
    assert!(matches!(b.join("B", |_| {}), Err(NetworkError::AlreadyOpen)));
    assert!(a.is_open());
}

/// Test: Disconnect closes both sides
/// When A disconnects
/// Then A is closed at once and B observes the channel closing
#[tokio::test]
async fn test_disconnect_closes_peer() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (mut a, _, b, _) = connected_pair(&transport, &relay, fast_config()).await;

    assert_ok!(a.disconnect().await);
    assert_eq!(a.state(), ConnectionState::Closed);
    wait_until(WAIT, || b.state() == ConnectionState::Closed).await;

    assert!(transport.endpoints().iter().all(|e| e.is_closed()));
    let err = a.send(&json!({"text": "late"})).await.unwrap_err();
    assert!(matches!(err, NetworkError::ChannelNotOpen));
    assert!(matches!(
        a.disconnect().await,
        Err(NetworkError::NotOpenCannotDisconnect)
    ));
}

/// Test: Reconnect after disconnect
/// Given a pair that connected and then disconnected
/// When both start again
/// Then a fresh channel opens
#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (mut a, _, mut b, _) = connected_pair(&transport, &relay, fast_config()).await;

    a.disconnect().await.unwrap();
    wait_until(WAIT, || b.state() == ConnectionState::Closed).await;

    let b_inbox = Inbox::default();
    let a_ready = a.host("A", |_| {}).unwrap();
    let b_ready = b.join("B", collector(&b_inbox)).unwrap();
    within(WAIT, a_ready.wait()).await.unwrap();
    within(WAIT, b_ready.wait()).await.unwrap();

    a.send(&json!({"text": "again"})).await.unwrap();
    wait_until(WAIT, || !b_inbox.lock().is_empty()).await;
    assert_eq!(b_inbox.lock()[0], json!({"text": "again"}));
    assert_eq!(transport.endpoints().len(), 4);
}

/// Test: Malformed frame on an open channel
/// When the peer sends a frame that is not JSON
/// Then it is dropped and the channel stays usable
#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (_a, _, b, b_inbox) = connected_pair(&transport, &relay, fast_config()).await;

    let host_channel = transport
        .endpoints()
        .into_iter()
        .find_map(|endpoint| endpoint.channel())
        .expect("host channel");
    host_channel.send_raw("{not json").await.unwrap();
    host_channel.send_raw(r#"{"text":"ok"}"#).await.unwrap();

    wait_until(WAIT, || !b_inbox.lock().is_empty()).await;
    assert_eq!(*b_inbox.lock(), vec![json!({"text": "ok"})]);
    assert!(b.is_open());
}

/// Test: Rejected offer
/// Given a transport that refuses remote descriptions
/// When the joiner receives an offer
/// Then the ready signal fails and the session is closed
#[tokio::test]
async fn test_rejected_offer_fails_attempt() {
    let transport = MemoryTransport::rejecting_descriptions();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    relay.inject("B", offer("memory-offer/99"));

    let mut b = session(&transport, &relay, fast_config());
    let ready = b.join("B", |_| {}).unwrap();

    let err = within(WAIT, ready.wait()).await.unwrap_err();
    assert!(matches!(err, NetworkError::Negotiation(_)));
    assert_eq!(b.state(), ConnectionState::Closed);
    assert!(transport.endpoints()[0].is_closed());
    assert!(relay.posted_by(&ClientId::from("B")).is_empty());

    // A failed attempt may be retried
    let _ready = b.join("B", |_| {}).unwrap();
    assert_eq!(b.state(), ConnectionState::Initializing);
}

/// Test: Unparseable offer
/// Then negotiation fails the same way as a rejected one
#[tokio::test]
async fn test_garbage_offer_fails_attempt() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    relay.inject("B", offer("garbage"));

    let mut b = session(&transport, &relay, fast_config());
    let ready = b.join("B", |_| {}).unwrap();

    let err = within(WAIT, ready.wait()).await.unwrap_err();
    assert!(matches!(err, NetworkError::Negotiation(_)));
    assert_eq!(b.state(), ConnectionState::Closed);
}

/// Test: Stray messages during negotiation
/// Given an answer and an unknown message queued for the joiner before the offer
/// Then both are ignored and negotiation still completes
#[tokio::test]
async fn test_unexpected_messages_are_ignored() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    relay.inject(
        "B",
        HandshakeMessage::Answer {
            sdp: "memory-answer/7".to_string(),
        },
    );
    relay.inject("B", HandshakeMessage::Unrecognized);

    let (a, _, b, _) = connected_pair(&transport, &relay, fast_config()).await;
    assert!(a.is_open() && b.is_open());
}

/// Test: Dropping a negotiating session
/// Then the relay is no longer polled
#[tokio::test]
async fn test_drop_stops_polling() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let id = ClientId::from("B");

    let mut b = session(&transport, &relay, fast_config());
    let ready = b.join("B", |_| {}).unwrap();
    wait_until(WAIT, || relay.fetch_count(&id) > 1).await;

    drop(b);
    assert!(matches!(
        within(WAIT, ready.wait()).await,
        Err(NetworkError::NegotiationAborted)
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let after_drop = relay.fetch_count(&id);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(relay.fetch_count(&id), after_drop);
}

/// Test: ICE servers reach the transport
#[tokio::test]
async fn test_ice_servers_passed_to_transport() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let mut s = session(&transport, &relay, SessionConfig {
        poll: fast_config().poll,
        ..Default::default()
    });

    let expected = s.config().ice_servers.len();
    let _ready = s.host("A", |_| {}).unwrap();
    wait_until(WAIT, || !transport.endpoints().is_empty()).await;
    assert_eq!(transport.endpoints()[0].ice_server_count(), expected);
}

/// Test: Disconnect while the peer's close is still being handled
/// Given the remote channel closed and each side's endpoint close is still pending
/// When both sides disconnect
/// Then every endpoint ends up closed
#[tokio::test]
async fn test_disconnect_during_pending_close_closes_endpoint() {
    let transport = MemoryTransport::stalling_first_close();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    let (mut a, _, mut b, _) = connected_pair(&transport, &relay, fast_config()).await;

    let host_channel = transport
        .endpoints()
        .into_iter()
        .find_map(|endpoint| endpoint.channel())
        .expect("host channel");
    assert_ok!(host_channel.close().await);

    let endpoints = transport.endpoints();
    wait_until(WAIT, || endpoints.iter().all(|e| e.close_attempts() == 1)).await;
    assert!(endpoints.iter().all(|e| !e.is_closed()));
    assert!(a.is_open() && b.is_open());

    assert_ok!(within(WAIT, a.disconnect()).await);
    assert_ok!(within(WAIT, b.disconnect()).await);
    assert!(endpoints.iter().all(|e| e.is_closed()));
    assert_eq!(a.state(), ConnectionState::Closed);
    assert_eq!(b.state(), ConnectionState::Closed);
}

/// Test: Slow consumer
/// Given a small event buffer and a joiner whose callback is blocked
/// Then the host's sends stall once the buffer is full
/// And every accepted frame arrives in order once the callback resumes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_consumer_holds_back_sender() {
    let transport = MemoryTransport::new();
    let relay = MemoryRelay::new(Duration::from_millis(2));
    relay.pair("A", "B");
    let config = SessionConfig {
        event_buffer: 4,
        ..fast_config()
    };

    let released = Arc::new(AtomicBool::new(false));
    let inbox = Inbox::default();
    let (gate, sink) = (released.clone(), inbox.clone());

    let mut a = session(&transport, &relay, config.clone());
    let mut b = session(&transport, &relay, config);
    let a_ready = a.host("A", |_| {}).unwrap();
    let b_ready = b
        .join("B", move |payload| {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            sink.lock().push(payload);
        })
        .unwrap();
    within(WAIT, a_ready.wait()).await.unwrap();
    within(WAIT, b_ready.wait()).await.unwrap();

    let mut accepted: i64 = 0;
    for n in 0..32 {
        match tokio::time::timeout(Duration::from_millis(50), a.send(&json!({ "n": n }))).await {
            Ok(result) => {
                assert_ok!(result);
                accepted += 1;
            }
            Err(_) => break,
        }
    }
    // Four queued plus the one the blocked callback holds
    assert!((4..=5).contains(&accepted), "accepted {}", accepted);

    released.store(true, Ordering::SeqCst);
    wait_until(WAIT, || inbox.lock().len() == accepted as usize).await;
    let received: Vec<i64> = inbox
        .lock()
        .iter()
        .map(|v| v["n"].as_i64().unwrap())
        .collect();
    assert_eq!(received, (0..accepted).collect::<Vec<_>>());
}
