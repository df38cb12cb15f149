//! Geospatial pub/sub delivery across real multi-node meshes.

use std::time::Duration;

use meridian_integration_tests::{spawn_mesh, SETTLE};
use meridian_node::{NodeConfig, PubSubError, PublishOptions, Value};
use meridian_transport::Hub;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn collector() -> (impl FnMut(Value) + Send + 'static, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |value| {
            let _ = tx.send(value);
        },
        rx,
    )
}

#[tokio::test]
async fn delivery_follows_the_intersection_rule() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 3, NodeConfig::fast()).await;

    // Subscriber circles from the contract: at (10, 0), radius 6
    // overlaps a publish at (0, 0) radius 5; radius 4 does not.
    let (wide_cb, mut wide_rx) = collector();
    sessions[1]
        .access_pubsub("geo")
        .on("alerts", 10.0, 0.0, 6.0, wide_cb)
        .await
        .unwrap();

    let (narrow_cb, mut narrow_rx) = collector();
    sessions[2]
        .access_pubsub("geo")
        .on("alerts", 10.0, 0.0, 4.0, narrow_cb)
        .await
        .unwrap();

    // Let coverage gossip reach the publisher.
    sleep(SETTLE).await;

    sessions[0]
        .access_pubsub("geo")
        .publish("alerts", 0.0, 0.0, 5.0, "boom", PublishOptions::default())
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(2), wide_rx.recv())
        .await
        .expect("intersecting subscriber must be delivered")
        .unwrap();
    assert_eq!(delivered, Value::from("boom"));

    // The non-intersecting subscriber stays silent.
    assert!(
        timeout(Duration::from_millis(400), narrow_rx.recv())
            .await
            .is_err(),
        "subscriber outside the publish circle must not hear it"
    );
}

#[tokio::test]
async fn publisher_delivers_to_its_own_subscriptions() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 1, NodeConfig::fast()).await;

    let pubsub = sessions[0].access_pubsub("geo");
    let (cb, mut rx) = collector();
    pubsub.on("local", 0.0, 0.0, 10.0, cb).await.unwrap();

    pubsub
        .publish("local", 1.0, 1.0, 1.0, 7i64, PublishOptions::default())
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("same-node delivery")
        .unwrap();
    assert_eq!(delivered, Value::Int(7));
}

#[tokio::test]
async fn default_delivery_is_at_most_once() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 2, NodeConfig::fast()).await;

    let (cb, mut rx) = collector();
    sessions[1]
        .access_pubsub("geo")
        .on("events", 0.0, 0.0, 100.0, cb)
        .await
        .unwrap();
    sleep(SETTLE).await;

    sessions[0]
        .access_pubsub("geo")
        .publish("events", 0.0, 0.0, 1.0, "once", PublishOptions::default())
        .await
        .unwrap();

    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_ok());
    // No duplicate arrives afterwards.
    assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());
}

#[tokio::test]
async fn acknowledged_publish_resolves_ok() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 3, NodeConfig::fast()).await;

    let (cb, mut rx) = collector();
    sessions[2]
        .access_pubsub("geo")
        .on("critical", 5.0, 5.0, 10.0, cb)
        .await
        .unwrap();
    sleep(SETTLE).await;

    sessions[0]
        .access_pubsub("geo")
        .publish(
            "critical",
            5.0,
            5.0,
            1.0,
            "ack me",
            PublishOptions::acknowledged(),
        )
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("acknowledged publish must deliver")
        .unwrap();
    assert_eq!(delivered, Value::from("ack me"));
}

#[tokio::test]
async fn off_stops_delivery() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 2, NodeConfig::fast()).await;

    let subscriber = sessions[1].access_pubsub("geo");
    let (cb, mut rx) = collector();
    subscriber.on("feed", 0.0, 0.0, 50.0, cb).await.unwrap();
    sleep(SETTLE).await;

    let publisher = sessions[0].access_pubsub("geo");
    publisher
        .publish("feed", 0.0, 0.0, 1.0, "heard", PublishOptions::default())
        .await
        .unwrap();
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_ok());

    subscriber.off("feed").await.unwrap();
    sleep(SETTLE).await;

    publisher
        .publish("feed", 0.0, 0.0, 1.0, "unheard", PublishOptions::default())
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
        "unsubscribed topic must stay silent"
    );
}

#[tokio::test]
async fn negative_radius_is_invalid_region() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 1, NodeConfig::fast()).await;
    let pubsub = sessions[0].access_pubsub("geo");

    let err = pubsub
        .publish("t", 0.0, 0.0, -1.0, Value::Nil, PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidRegion { .. }));

    let err = pubsub
        .on("t", 0.0, 0.0, f64::NAN, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidRegion { .. }));
}

#[tokio::test]
async fn channels_are_independent_namespaces() {
    let hub = Hub::new();
    let sessions = spawn_mesh(&hub, 2, NodeConfig::fast()).await;

    let (cb, mut rx) = collector();
    sessions[1]
        .access_pubsub("channel-a")
        .on("topic", 0.0, 0.0, 50.0, cb)
        .await
        .unwrap();
    sleep(SETTLE).await;

    sessions[0]
        .access_pubsub("channel-b")
        .publish("topic", 0.0, 0.0, 1.0, "wrong channel", PublishOptions::default())
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());

    sessions[0]
        .access_pubsub("channel-a")
        .publish("topic", 0.0, 0.0, 1.0, "right channel", PublishOptions::default())
        .await
        .unwrap();
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.is_ok());
}
