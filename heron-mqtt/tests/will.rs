mod common;

use std::{sync::atomic::Ordering, time::Duration};

use common::{broker, config, eventually, Event, TestClient};
use heron_mqtt::{
    network::packet::{Connect, Disconnect, LastWill, Packet, QoS, ReasonCode},
    protocol::session::SessionTerminatedReason,
};

const QUIET: Duration = Duration::from_millis(200);

fn with_will(client_id: &str) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.will = Some(LastWill::new(
        format!("clients/{}/status", client_id),
        "offline",
        QoS::AtLeastOnce,
    ));
    connect
}

async fn watcher(broker: &heron_mqtt::Broker) -> TestClient {
    let mut a = TestClient::online(broker, Connect::new("A")).await;
    a.subscribe("clients/+/status", QoS::AtLeastOnce).await;
    a
}

#[tokio::test]
async fn will_published_when_transport_drops() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    let b = TestClient::online(&broker, with_will("B")).await;

    b.drop_connection();
    let will = a.recv_publish().await;
    assert_eq!(will.topic, "clients/B/status");
    assert_eq!(will.payload, "offline");
    assert_eq!(will.qos, QoS::AtLeastOnce);

    recorder
        .wait_for_event(Event::SessionTerminated(
            "B".into(),
            SessionTerminatedReason::ProtocolError,
        ))
        .await;
    let publish = recorder.position(&Event::WillPublish("B".into())).unwrap();
    let published = recorder
        .position(&Event::WillPublished("B".into(), "clients/B/status".into()))
        .unwrap();
    assert!(publish < published);
    assert_eq!(recorder.count(|e| matches!(e, Event::WillPublish(_))), 1);
    // 遗嘱不经过 on_publish
    assert_eq!(recorder.count(|e| matches!(e, Event::Publish(..))), 0);
}

#[tokio::test]
async fn normal_disconnect_discards_will() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    let mut b = TestClient::online(&broker, with_will("B")).await;

    b.send(Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
        .await;
    assert!(b.closed().await.is_empty());

    recorder
        .wait_for_event(Event::SessionTerminated(
            "B".into(),
            SessionTerminatedReason::NormalDisconnect,
        ))
        .await;
    assert!(a.try_recv(QUIET).await.is_none());
    assert_eq!(recorder.count(|e| matches!(e, Event::WillPublish(_))), 0);
}

#[tokio::test]
async fn disconnect_with_will_publishes_will() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    let b = TestClient::online(&broker, with_will("B")).await;

    b.send(Packet::Disconnect(Disconnect::new(ReasonCode::DisconnectWithWill)))
        .await;
    assert_eq!(a.recv_publish().await.topic, "clients/B/status");

    recorder
        .wait_for_event(Event::SessionTerminated(
            "B".into(),
            SessionTerminatedReason::NormalDisconnect,
        ))
        .await;
    assert!(recorder.events().contains(&Event::Closed("B".into(), None)));
}

#[tokio::test]
async fn takeover_publishes_will_of_old_connection() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    let _b1 = TestClient::online(&broker, with_will("B")).await;
    let _b2 = TestClient::online(&broker, Connect::new("B")).await;

    assert_eq!(a.recv_publish().await.topic, "clients/B/status");
    recorder
        .wait_for_event(Event::WillPublished("B".into(), "clients/B/status".into()))
        .await;
    let published = recorder
        .position(&Event::WillPublished("B".into(), "clients/B/status".into()))
        .unwrap();
    let connected = recorder
        .events()
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == Event::Connected("B".into()))
        .map(|(i, _)| i)
        .last()
        .unwrap();
    assert!(published < connected);
}

#[tokio::test]
async fn keep_alive_timeout_publishes_will() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    let mut connect = with_will("B");
    connect.keep_alive = 1;
    let _b = TestClient::online(&broker, connect).await;

    assert_eq!(a.recv_publish().await.topic, "clients/B/status");
    recorder
        .wait_for_event(Event::SessionTerminated(
            "B".into(),
            SessionTerminatedReason::KeepAliveTimeout,
        ))
        .await;
}

#[tokio::test]
async fn retained_will_kept_for_late_subscribers() {
    let (broker, _) = broker(config());
    let mut connect = with_will("B");
    if let Some(will) = connect.will.as_mut() {
        will.retain = true;
    }
    let b = TestClient::online(&broker, connect).await;
    b.drop_connection();

    eventually("will retained", || broker.retained_count() == 1).await;

    let mut a = watcher(&broker).await;
    let will = a.recv_publish().await;
    assert!(will.retain);
    assert_eq!(will.payload, "offline");
}

#[tokio::test]
async fn rejected_connect_never_publishes_will() {
    let (broker, recorder) = broker(config());
    let mut a = watcher(&broker).await;
    recorder.reject_basic_auth.store(true, Ordering::SeqCst);

    let (mut b, ack) = TestClient::connect(&broker, with_will("B")).await;
    assert_eq!(ack.code, ReasonCode::NotAuthorized);
    b.closed().await;

    assert!(a.try_recv(QUIET).await.is_none());
    assert_eq!(recorder.count(|e| matches!(e, Event::WillPublish(_))), 0);
}
