//! Client facade against a real relay server on a loopback socket.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use magcue_client::{ClientError, RelayClient, Unsubscribe};
use magcue_hal::RecordingLink;
use magcue_hub::BroadcastHub;
use magcue_types::{ActuatorCommand, DistanceReading};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

struct Relay {
    link: Arc<RecordingLink>,
    hub: Arc<BroadcastHub>,
    url: String,
    _stop: oneshot::Sender<()>,
}

async fn start_relay() -> Relay {
    let link = Arc::new(RecordingLink::new());
    let hub = Arc::new(BroadcastHub::new(link.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(magcue_server::serve(listener, hub.clone(), async move {
        let _ = stopped.await;
    }));
    Relay {
        link,
        hub,
        url,
        _stop: stop,
    }
}

fn reading(percent: f64) -> DistanceReading {
    DistanceReading::new(percent, Utc::now()).unwrap()
}

fn status_feed(client: &RelayClient) -> (Unsubscribe, mpsc::UnboundedReceiver<bool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = client.on_status(move |connected| {
        let _ = tx.send(connected);
    });
    (token, rx)
}

fn distance_feed(client: &RelayClient) -> (Unsubscribe, mpsc::UnboundedReceiver<f64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = client.on_distance(move |percent| {
        let _ = tx.send(percent);
    });
    (token, rx)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("listener dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Connect and consume the initial push plus the sync reply.
async fn connected_client(relay: &Relay) -> (RelayClient, mpsc::UnboundedReceiver<bool>, Unsubscribe) {
    let client = RelayClient::new(relay.url.clone());
    let (token, mut status) = status_feed(&client);
    client.connect().await.unwrap();
    let expected = relay.hub.connected();
    assert_eq!(next(&mut status).await, expected);
    assert_eq!(next(&mut status).await, expected);
    (client, status, token)
}

#[tokio::test]
async fn connect_delivers_cached_status_and_readings() {
    let relay = start_relay().await;
    relay.hub.publish_status(true);

    let client = RelayClient::new(relay.url.clone());
    let (_s, mut status) = status_feed(&client);
    let (_d, mut distance) = distance_feed(&client);
    client.connect().await.unwrap();
    assert!(client.is_connected());

    assert!(next(&mut status).await);
    assert!(next(&mut status).await);

    relay.hub.publish_reading(reading(0.0));
    relay.hub.publish_reading(reading(42.5));
    assert_eq!(next(&mut distance).await, 0.0);
    assert_eq!(next(&mut distance).await, 42.5);
}

#[tokio::test]
async fn status_changes_reach_listeners() {
    let relay = start_relay().await;
    let (_client, mut status, _token) = connected_client(&relay).await;

    relay.hub.publish_status(true);
    assert!(next(&mut status).await);
    relay.hub.publish_status(false);
    assert!(!next(&mut status).await);
}

#[tokio::test]
async fn sync_status_requests_a_fresh_push() {
    let relay = start_relay().await;
    let (client, mut status, _token) = connected_client(&relay).await;

    client.sync_status();
    assert!(!next(&mut status).await);
    assert!(timeout(Duration::from_millis(100), status.recv()).await.is_err());
}

#[tokio::test]
async fn actuator_levels_are_validated_before_sending() {
    let relay = start_relay().await;
    let (client, _status, _token) = connected_client(&relay).await;

    client.set_actuator_level(7);
    client.set_actuator_level(-2);
    client.set_actuator_level(3);

    let link = relay.link.clone();
    eventually(move || !link.commands().is_empty()).await;
    assert_eq!(relay.link.commands(), vec![ActuatorCommand::new(3).unwrap()]);
}

#[tokio::test]
async fn unsubscribed_listener_is_not_called() {
    let relay = start_relay().await;
    let (client, _status, _token) = connected_client(&relay).await;

    let (gone, mut gone_rx) = distance_feed(&client);
    let (_kept, mut kept_rx) = distance_feed(&client);
    gone.unsubscribe();

    relay.hub.publish_reading(reading(12.0));
    assert_eq!(next(&mut kept_rx).await, 12.0);
    assert!(gone_rx.try_recv().is_err());
}

#[tokio::test]
async fn panicking_listener_does_not_break_delivery() {
    let relay = start_relay().await;
    let (client, _status, _token) = connected_client(&relay).await;

    let _bad = client.on_distance(|_| panic!("consumer bug"));
    let (_good, mut good_rx) = distance_feed(&client);

    relay.hub.publish_reading(reading(10.0));
    relay.hub.publish_reading(reading(20.0));
    assert_eq!(next(&mut good_rx).await, 10.0);
    assert_eq!(next(&mut good_rx).await, 20.0);
}

#[tokio::test]
async fn disconnect_keeps_the_shared_channel() {
    let relay = start_relay().await;
    let (client, _status, _token) = connected_client(&relay).await;
    let view = client.clone();
    let (_d, mut distance) = distance_feed(&client);

    view.disconnect();
    assert!(client.is_connected());
    assert_eq!(relay.hub.subscriber_count(), 1);

    relay.hub.publish_reading(reading(55.0));
    assert_eq!(next(&mut distance).await, 55.0);
}

#[tokio::test]
async fn reconnect_while_connected_reuses_the_channel() {
    let relay = start_relay().await;
    let (client, _status, _token) = connected_client(&relay).await;

    client.reconnect().await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(relay.hub.subscriber_count(), 1);
}

#[tokio::test]
async fn connect_to_closed_port_fails_with_status_false() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = RelayClient::new(url);
    let (_s, mut status) = status_feed(&client);
    let result = client.connect().await;

    assert!(matches!(result, Err(ClientError::Connect { .. })));
    assert!(!next(&mut status).await);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn losing_the_relay_reports_false_and_reconnect_recovers() {
    // A relay that accepts one socket, then hangs up on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let flaky = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);
        listener
    });

    let client = RelayClient::new(format!("ws://{addr}"));
    let (_s, mut status) = status_feed(&client);
    client.connect().await.unwrap();

    assert!(!next(&mut status).await);
    assert!(!client.is_connected());

    // Serve a real relay on the same port and reconnect.
    let listener = flaky.await.unwrap();
    let hub = Arc::new(BroadcastHub::new(Arc::new(RecordingLink::new())));
    hub.publish_status(true);
    let (_stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(magcue_server::serve(listener, hub.clone(), async move {
        let _ = stopped.await;
    }));

    client.reconnect().await.unwrap();
    assert!(client.is_connected());
    assert!(next(&mut status).await);
}
