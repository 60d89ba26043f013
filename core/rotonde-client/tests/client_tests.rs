use pretty_assertions::assert_eq;
use rotonde_client::transport::mock::{MockConnector, MockPeer};
use rotonde_client::{handler, ClientConfig, ClientError, ConnectionState, RotondeClient};
use rotonde_types::{Action, Category, Definition, Event, Field, Packet, Subscription};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Helpers ──────────────────────────────────────────────────────

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn client_with_peers(count: usize) -> (RotondeClient, Vec<MockPeer>) {
    let connector = Arc::new(MockConnector::new());
    let peers = (0..count).map(|_| connector.add_peer()).collect();
    let client = RotondeClient::with_connector(ClientConfig::new("ws://bus.test/"), connector);
    (client, peers)
}

async fn connected() -> (RotondeClient, MockPeer) {
    let (client, mut peers) = client_with_peers(1);
    client.connect();
    client.wait_connected().await.unwrap();
    (client, peers.remove(0))
}

/// Every packet the client has written so far.
async fn drain(peer: &mut MockPeer) -> Vec<Packet> {
    settle().await;
    let mut packets = Vec::new();
    while let Some(packet) = peer.try_next_sent() {
        packets.push(packet);
    }
    packets
}

fn sub(identifier: &str) -> Packet {
    Packet::Subscribe(Subscription::new(identifier))
}

fn unsub(identifier: &str) -> Packet {
    Packet::Unsubscribe(Subscription::new(identifier))
}

fn event_def(identifier: &str) -> Definition {
    Definition::new(Category::Event, identifier)
}

fn action_def(identifier: &str) -> Definition {
    Definition::new(Category::Action, identifier)
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// ── Connection ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn new_client_is_idle() {
    let (client, _peers) = client_with_peers(1);

    assert_eq!(client.connection_state(), ConnectionState::Idle);
    assert!(!client.is_connected());
    assert_eq!(client.url(), "ws://bus.test/");
    assert!(matches!(
        client.send_action("act", json!(null)),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        client.wait_connected().await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn default_config_points_at_local_bus() {
    let config = ClientConfig::default();
    assert_eq!(config.url, "ws://localhost:4224/");
    assert_eq!(config.timeout(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn connect_failure_reports_failed() {
    let (client, _peers) = client_with_peers(0);
    client.connect();

    assert!(matches!(
        client.wait_connected().await,
        Err(ClientError::Connection(_))
    ));
    assert_eq!(client.connection_state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_to_idle() {
    let (client, mut peer) = connected().await;

    client.disconnect();

    assert_eq!(client.connection_state(), ConnectionState::Idle);
    assert!(peer.next_sent().await.is_none());
    assert!(matches!(
        client.send_event("ev", json!(1)),
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_replaces_previous_transport() {
    let (client, mut peers) = client_with_peers(2);
    let mut second = peers.pop().unwrap();
    let mut first = peers.pop().unwrap();

    client.connect();
    client.connect();
    client.wait_connected().await.unwrap();
    client.send_event("ev", json!(1)).unwrap();

    assert!(first.next_sent().await.is_none());
    assert_eq!(
        second.next_sent().await.unwrap(),
        Packet::Event(Event::new("ev", json!(1)))
    );
}

// ── Ready sequence ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_replays_callbacks_subscriptions_and_definitions() {
    let (client, mut peers) = client_with_peers(1);
    let mut peer = peers.remove(0);

    client.event_handlers().attach("IMU", handler(|_: &Event| {}));
    client.event_handlers().attach("*", handler(|_: &Event| {}));
    client
        .add_local_definition(Category::Action, "MOTOR", vec![], false)
        .unwrap();
    client
        .add_local_definition(Category::Event, "BUTTON", vec![], false)
        .unwrap();
    let ready_client = client.clone();
    client.on_ready(move || {
        ready_client.send_event("HELLO", json!(null)).unwrap();
    });

    client.connect();
    client.wait_connected().await.unwrap();

    assert_eq!(
        drain(&mut peer).await,
        vec![
            Packet::Event(Event::new("HELLO", json!(null))),
            sub("IMU"),
            Packet::Definition(action_def("MOTOR")),
            Packet::Definition(event_def("BUTTON")),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn ready_callbacks_run_on_every_connect() {
    let (client, mut peers) = client_with_peers(2);
    let (count, callback) = counter();
    client.on_ready(callback);

    client.connect();
    client.wait_connected().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    peers[0].close();
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);

    client.connect();
    client.wait_connected().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn on_ready_runs_immediately_when_connected() {
    let (client, _peer) = connected().await;
    let (count, callback) = counter();

    client.on_ready(callback);

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_to_new_peer() {
    let (client, mut peers) = client_with_peers(2);
    let mut second = peers.pop().unwrap();
    let mut first = peers.pop().unwrap();
    client.event_handlers().attach("IMU", handler(|_: &Event| {}));

    client.connect();
    client.wait_connected().await.unwrap();
    assert_eq!(drain(&mut first).await, vec![sub("IMU")]);

    first.close();
    settle().await;
    client.connect();
    client.wait_connected().await.unwrap();

    assert_eq!(drain(&mut second).await, vec![sub("IMU")]);
}

// ── Event subscriptions ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn first_handler_subscribes_last_unsubscribes() {
    let (client, mut peer) = connected().await;
    let a = handler(|_: &Event| {});
    let b = handler(|_: &Event| {});

    client.event_handlers().attach("IMU", Arc::clone(&a));
    client.event_handlers().attach("IMU", Arc::clone(&b));
    assert_eq!(drain(&mut peer).await, vec![sub("IMU")]);

    client.event_handlers().detach("IMU", &a);
    assert!(drain(&mut peer).await.is_empty());

    client.event_handlers().detach("IMU", &b);
    assert_eq!(drain(&mut peer).await, vec![unsub("IMU")]);
}

#[tokio::test(start_paused = true)]
async fn expired_handler_unsubscribes() {
    let (client, mut peer) = connected().await;
    client.event_handlers().attach_once("IMU", handler(|_: &Event| {}));
    assert_eq!(drain(&mut peer).await, vec![sub("IMU")]);

    peer.deliver(&Packet::Event(Event::new("IMU", json!(1))));

    assert_eq!(drain(&mut peer).await, vec![unsub("IMU")]);
}

#[tokio::test(start_paused = true)]
async fn wildcard_handler_never_subscribes() {
    let (client, mut peer) = connected().await;
    let w = handler(|_: &Event| {});

    client.event_handlers().attach("*", Arc::clone(&w));
    client.event_handlers().detach("*", &w);

    assert!(drain(&mut peer).await.is_empty());
}

// ── Inbound routing ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn events_and_actions_reach_their_handlers() {
    let (client, peer) = connected().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let events = Arc::clone(&seen);
    client.event_handlers().attach(
        "IMU",
        handler(move |e: &Event| events.lock().unwrap().push(format!("event {}", e.data))),
    );
    let wildcard = Arc::clone(&seen);
    client.event_handlers().attach(
        "*",
        handler(move |e: &Event| wildcard.lock().unwrap().push(format!("any {}", e.identifier))),
    );
    let actions = Arc::clone(&seen);
    client.action_handlers().attach(
        "MOTOR",
        handler(move |a: &Action| actions.lock().unwrap().push(format!("action {}", a.data))),
    );

    peer.deliver(&Packet::Event(Event::new("IMU", json!(1))));
    peer.deliver(&Packet::Action(Action::new("MOTOR", json!(2))));
    peer.deliver(&Packet::Event(Event::new("OTHER", json!(3))));
    settle().await;

    assert_eq!(
        seen.lock().unwrap().clone(),
        vec!["event 1", "any IMU", "action 2", "any OTHER"]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_definitions_are_merged_and_announced() {
    let (client, peer) = connected().await;
    let announced = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&announced);
    client
        .definition_handlers()
        .attach("IMU", handler(move |d: &Definition| sink.lock().unwrap().push(d.clone())));

    peer.deliver(&Packet::Definition(
        event_def("IMU").with_fields(vec![Field::new("x", "number", "")]),
    ));
    peer.deliver(&Packet::Definition(
        event_def("IMU").with_fields(vec![Field::new("y", "number", "")]),
    ));
    settle().await;

    let merged = event_def("IMU").with_fields(vec![
        Field::new("x", "number", ""),
        Field::new("y", "number", ""),
    ]);
    assert_eq!(client.get_remote_definition(Category::Event, "IMU"), Some(merged.clone()));
    assert_eq!(client.get_remote_definition(Category::Action, "IMU"), None);
    assert_eq!(announced.lock().unwrap().last(), Some(&merged));
}

#[tokio::test(start_paused = true)]
async fn remote_undefinition_removes_and_announces() {
    let (client, peer) = connected().await;
    let (count, callback) = counter();
    client
        .undefinition_handlers()
        .attach("IMU", handler(move |_: &Definition| callback()));

    peer.deliver(&Packet::Definition(event_def("IMU")));
    peer.deliver(&Packet::UnDefinition(event_def("IMU")));
    settle().await;

    assert_eq!(client.get_remote_definition(Category::Event, "IMU"), None);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn event_definition_resubscribes_waiting_handlers() {
    let (client, mut peer) = connected().await;
    client.event_handlers().attach("IMU", handler(|_: &Event| {}));
    assert_eq!(drain(&mut peer).await, vec![sub("IMU")]);

    peer.deliver(&Packet::Definition(event_def("IMU")));
    assert_eq!(drain(&mut peer).await, vec![sub("IMU")]);

    peer.deliver(&Packet::Definition(event_def("UNWATCHED")));
    peer.deliver(&Packet::Definition(action_def("IMU")));
    assert!(drain(&mut peer).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbound_subscriptions_are_ignored() {
    let (client, mut peer) = connected().await;

    peer.deliver(&sub("IMU"));
    peer.deliver(&unsub("IMU"));

    assert!(drain(&mut peer).await.is_empty());
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn handle_packet_routes_without_connection() {
    let (client, _peers) = client_with_peers(0);
    client.event_handlers().attach("IMU", handler(|_: &Event| {}));

    client.handle_packet(Packet::Definition(event_def("IMU")));

    assert!(client.get_remote_definition(Category::Event, "IMU").is_some());
}

// ── Local definitions ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn local_definitions_publish_when_connected() {
    let (client, mut peer) = connected().await;

    client
        .add_local_definition(
            Category::Action,
            "MOTOR",
            vec![Field::new("speed", "number", "rpm")],
            false,
        )
        .unwrap();
    client
        .add_local_definition(
            Category::Action,
            "MOTOR",
            vec![Field::new("dir", "string", "")],
            true,
        )
        .unwrap();

    let merged = action_def("MOTOR")
        .with_fields(vec![
            Field::new("speed", "number", "rpm"),
            Field::new("dir", "string", ""),
        ])
        .with_array(true);
    let sent = drain(&mut peer).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1], Packet::Definition(merged.clone()));
    assert_eq!(client.get_local_definition(Category::Action, "MOTOR"), Some(merged));
}

#[tokio::test(start_paused = true)]
async fn removing_local_definition_retracts_it() {
    let (client, mut peer) = connected().await;
    client
        .add_local_definition(Category::Event, "BUTTON", vec![], false)
        .unwrap();

    client.remove_local_definition(Category::Event, "BUTTON").unwrap();
    client.remove_local_definition(Category::Event, "UNKNOWN").unwrap();

    assert_eq!(
        drain(&mut peer).await,
        vec![
            Packet::Definition(event_def("BUTTON")),
            Packet::UnDefinition(event_def("BUTTON")),
        ]
    );
    assert_eq!(client.get_local_definition(Category::Event, "BUTTON"), None);
}

#[tokio::test(start_paused = true)]
async fn local_definitions_are_stored_while_disconnected() {
    let (client, _peers) = client_with_peers(0);

    client
        .add_local_definition(Category::Event, "BUTTON", vec![], false)
        .unwrap();
    client.remove_local_definition(Category::Action, "BUTTON").unwrap();

    assert!(client.get_local_definition(Category::Event, "BUTTON").is_some());
}
