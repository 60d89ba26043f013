use clap::Parser;
use rotonde_client::transport::mock::{MockConnector, MockPeer};
use rotonde_client::RotondeClient;
use rotonde_monitor::{attach_loggers, negotiate, Args};
use rotonde_types::{Action, Category, Definition, Event, Packet, Subscription};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn connected(args: &Args) -> (RotondeClient, MockPeer) {
    let connector = Arc::new(MockConnector::new());
    let peer = connector.add_peer();
    let client = RotondeClient::with_connector(args.client_config(), connector);
    attach_loggers(&client, args);
    client.connect();
    client.wait_connected().await.unwrap();
    (client, peer)
}

fn args(extra: &[&str]) -> Args {
    let argv = ["rotonde-monitor", "--timeout-ms", "500"]
        .into_iter()
        .chain(extra.iter().copied());
    Args::try_parse_from(argv).unwrap()
}

async fn next_sent(peer: &mut MockPeer) -> Packet {
    tokio::time::timeout(Duration::from_secs(1), peer.next_sent())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn loggers_subscribe_watched_events() {
    let args = args(&["--event", "IMU"]);
    let (client, mut peer) = connected(&args).await;

    assert_eq!(
        next_sent(&mut peer).await,
        Packet::Subscribe(Subscription::new("IMU"))
    );
    assert!(client.event_handlers().is_registered("IMU"));
    assert!(client.definition_handlers().is_registered("*"));
    assert!(client.undefinition_handlers().is_registered("*"));
}

#[tokio::test(start_paused = true)]
async fn nothing_to_negotiate() {
    let args = args(&[]);
    let (client, _peer) = connected(&args).await;

    assert!(negotiate(&client, &args).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn negotiates_required_schema_then_actions() {
    let args = args(&[
        "--require",
        "LED",
        "--action",
        "LED=true",
        "--expect",
        "LED_STATUS",
    ]);
    let (client, mut peer) = connected(&args).await;

    let task = tokio::spawn({
        let client = client.clone();
        let args = args.clone();
        async move { negotiate(&client, &args).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    peer.deliver(&Packet::Definition(Definition::new(Category::Action, "LED")));
    peer.deliver(&Packet::Definition(Definition::new(
        Category::Event,
        "LED_STATUS",
    )));

    assert_eq!(
        next_sent(&mut peer).await,
        Packet::Subscribe(Subscription::new("LED_STATUS"))
    );
    assert_eq!(
        next_sent(&mut peer).await,
        Packet::Action(Action::new("LED", json!(true)))
    );

    let status = Event::new("LED_STATUS", json!({"on": true}));
    peer.deliver(&Packet::Event(status.clone()));

    assert_eq!(task.await.unwrap().unwrap(), vec![status]);
}

#[tokio::test(start_paused = true)]
async fn missing_requirement_fails_with_context() {
    let args = args(&["--require", "GPS"]);
    let (client, _peer) = connected(&args).await;

    let err = negotiate(&client, &args).await.unwrap_err();

    assert_eq!(err.to_string(), "Required definitions did not arrive");
    assert_eq!(
        format!("{err:#}"),
        "Required definitions did not arrive: timed out waiting for GPS"
    );
}
