mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{broker, config, Event, TestClient};
use heron_mqtt::{
    error::CloseReason,
    network::packet::{Auth, Connect, Disconnect, Packet, ReasonCode},
    protocol::session::SessionTerminatedReason,
    AuthResponse, Broker, HookError,
};
use tokio::time;

fn scram(client_id: &str) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.auth_method = Some("scram".into());
    connect.auth_data = Some(Bytes::from_static(b"client-first"));
    connect
}

fn auth_rounds(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::EnhancedAuth(_) | Event::Auth(..)))
        .count()
}

/// 发送 CONNECT，回复 AUTH 直到收到 CONNACK
async fn connect_scram(broker: &Broker, client_id: &str) -> (TestClient, Packet) {
    let mut client = TestClient::open(broker, &format!("memory-{}", client_id))
        .await
        .unwrap();
    client.send(Packet::Connect(scram(client_id))).await;
    loop {
        match client.recv().await {
            Packet::Auth(auth) => {
                assert_eq!(auth.code, ReasonCode::ContinueAuthentication);
                assert_eq!(auth.method.as_deref(), Some("scram"));
                client
                    .send(Packet::Auth(Auth::new(
                        ReasonCode::ContinueAuthentication,
                        "scram",
                        "client-final",
                    )))
                    .await;
            }
            packet => return (client, packet),
        }
    }
}

#[tokio::test]
async fn two_round_enhanced_auth() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![
        Ok(AuthResponse::challenge("server-first")),
        Ok(AuthResponse::success("server-final")),
    ]);

    let mut client = TestClient::open(&broker, "memory-A").await.unwrap();
    client.send(Packet::Connect(scram("A"))).await;

    assert_eq!(
        client.recv().await,
        Packet::Auth(Auth::new(
            ReasonCode::ContinueAuthentication,
            "scram",
            "server-first"
        ))
    );
    client
        .send(Packet::Auth(Auth::new(
            ReasonCode::ContinueAuthentication,
            "scram",
            "client-final",
        )))
        .await;

    match client.recv().await {
        Packet::ConnAck(ack) => {
            assert_eq!(ack.code, ReasonCode::Success);
            assert_eq!(ack.auth_method.as_deref(), Some("scram"));
            assert_eq!(ack.auth_data, Some(Bytes::from_static(b"server-final")));
        }
        packet => panic!("expect CONNACK, got {:?}", packet),
    }

    recorder.wait_for_event(Event::Connected("A".into())).await;
    let events = recorder.events();
    assert_eq!(auth_rounds(&events), 2);
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Connected(_))).count(), 1);
    assert_eq!(recorder.count(|e| matches!(e, Event::BasicAuth(_))), 0);
}

#[tokio::test]
async fn single_round_enhanced_auth() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![Ok(AuthResponse::success(Bytes::new()))]);

    let (_client, packet) = connect_scram(&broker, "A").await;
    assert!(matches!(packet, Packet::ConnAck(ack) if ack.code == ReasonCode::Success));
    assert_eq!(auth_rounds(&recorder.events()), 1);
}

#[tokio::test]
async fn auth_rounds_are_capped() {
    let mut cfg = config();
    cfg.broker.max_auth_rounds = 2;
    let (broker, recorder) = broker(cfg);
    recorder.script_auth(vec![
        Ok(AuthResponse::challenge("1")),
        Ok(AuthResponse::challenge("2")),
        Ok(AuthResponse::challenge("3")),
    ]);

    let (mut client, packet) = connect_scram(&broker, "A").await;
    assert!(matches!(packet, Packet::ConnAck(ack) if ack.code == ReasonCode::NotAuthorized));
    client.closed().await;

    assert_eq!(auth_rounds(&recorder.events()), 2);
    assert_eq!(recorder.count(|e| matches!(e, Event::Connected(_))), 0);
}

#[tokio::test]
async fn auth_method_must_not_change() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![Ok(AuthResponse::challenge("server-first"))]);

    let mut client = TestClient::open(&broker, "memory-A").await.unwrap();
    client.send(Packet::Connect(scram("A"))).await;
    assert!(matches!(client.recv().await, Packet::Auth(_)));

    client
        .send(Packet::Auth(Auth::new(
            ReasonCode::ContinueAuthentication,
            "plain",
            "client-final",
        )))
        .await;
    assert!(matches!(
        client.recv().await,
        Packet::ConnAck(ack) if ack.code == ReasonCode::BadAuthenticationMethod
    ));
}

#[tokio::test]
async fn hook_rejection_code_is_returned() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![Err(HookError::new(
        ReasonCode::BadUserNameOrPassword,
        "wrong secret",
    ))]);

    let (_client, packet) = connect_scram(&broker, "A").await;
    assert!(matches!(
        packet,
        Packet::ConnAck(ack) if ack.code == ReasonCode::BadUserNameOrPassword && !ack.session_present
    ));
}

#[tokio::test]
async fn enhanced_auth_unsupported_by_default() {
    let broker = Broker::new(config());

    let (_client, packet) = connect_scram(&broker, "A").await;
    assert!(matches!(
        packet,
        Packet::ConnAck(ack) if ack.code == ReasonCode::BadAuthenticationMethod
    ));
    assert!(!broker.is_connected("A"));
}

#[tokio::test]
async fn re_authentication_succeeds_over_two_rounds() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![
        Ok(AuthResponse::success(Bytes::new())),
        Ok(AuthResponse::challenge("again")),
        Ok(AuthResponse::success("done")),
    ]);

    let (mut client, packet) = connect_scram(&broker, "A").await;
    assert!(matches!(packet, Packet::ConnAck(ack) if ack.code == ReasonCode::Success));

    client
        .send(Packet::Auth(Auth::new(ReasonCode::ReAuthenticate, "scram", "re")))
        .await;
    assert_eq!(
        client.recv().await,
        Packet::Auth(Auth::new(ReasonCode::ContinueAuthentication, "scram", "again"))
    );
    client
        .send(Packet::Auth(Auth::new(
            ReasonCode::ContinueAuthentication,
            "scram",
            "re-final",
        )))
        .await;
    assert_eq!(
        client.recv().await,
        Packet::Auth(Auth::new(ReasonCode::Success, "scram", "done"))
    );

    // 连接仍然可用
    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, Packet::PingResp);
    assert_eq!(recorder.count(|e| matches!(e, Event::ReAuth(_))), 1);
    assert!(broker.is_connected("A"));
}

#[tokio::test]
async fn re_authentication_failure_terminates_persistent_session() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![
        Ok(AuthResponse::success(Bytes::new())),
        Err(HookError::not_authorized("token revoked")),
    ]);

    let mut client = TestClient::open(&broker, "memory-A").await.unwrap();
    let mut connect = scram("A");
    connect.session_expiry_interval = 300;
    client.send(Packet::Connect(connect)).await;
    assert!(matches!(client.recv().await, Packet::ConnAck(ack) if ack.code == ReasonCode::Success));

    client
        .send(Packet::Auth(Auth::new(ReasonCode::ReAuthenticate, "scram", "re")))
        .await;
    assert_eq!(
        client.closed().await,
        vec![Packet::Disconnect(Disconnect::new(ReasonCode::NotAuthorized))]
    );

    recorder
        .wait_for_event(Event::SessionTerminated(
            "A".into(),
            SessionTerminatedReason::AuthenticationFailure,
        ))
        .await;
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn auth_after_basic_connect_is_a_protocol_error() {
    let (broker, _) = broker(config());
    let mut client = TestClient::online(&broker, Connect::new("A")).await;

    client
        .send(Packet::Auth(Auth::new(ReasonCode::ReAuthenticate, "scram", "")))
        .await;
    assert_eq!(
        client.closed().await,
        vec![Packet::Disconnect(Disconnect::new(ReasonCode::ProtocolError))]
    );
}

#[tokio::test]
async fn stop_cancels_auth_exchange_in_progress() {
    let (broker, recorder) = broker(config());
    recorder.script_auth(vec![Ok(AuthResponse::challenge("server-first"))]);

    let mut client = TestClient::open(&broker, "memory-A").await.unwrap();
    client.send(Packet::Connect(scram("A"))).await;
    match client.recv().await {
        Packet::Auth(auth) => assert_eq!(auth.code, ReasonCode::ContinueAuthentication),
        packet => panic!("expect AUTH, got {:?}", packet),
    }

    // 客户端不再回复 AUTH，stop 不需要等到认证超时
    time::timeout(Duration::from_secs(2), broker.stop())
        .await
        .expect("stop waits for the auth exchange");
    assert!(client.closed().await.is_empty());

    let events = recorder.events();
    assert!(events.contains(&Event::Closed(
        "A".into(),
        Some(CloseReason::Administrative("broker stopped".into()))
    )));
    assert_eq!(recorder.count(|e| matches!(e, Event::Connected(_))), 0);
    assert_eq!(recorder.count(|e| matches!(e, Event::SessionCreated(_))), 0);
    assert_eq!(events.last(), Some(&Event::Stop));
}
