//! Connection lifecycle tests against a scripted transport.

mod common;

use common::*;
use millrace::protocol::Action;
use millrace::{
    codes, AuthCallback, ConnectionState, ErrorInfo, MillraceClient, MillraceError, TokenDetails,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn client_with(server: &MockServer, options: millrace::MillraceOptions) -> MillraceClient {
    MillraceClient::with_transport_factory(options, server.factory())
        .expect("client construction failed")
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let server = MockServer::new();
    let client = client_with(&server, test_options());

    client.connect().await.unwrap();
    wait_until("connected", || client.is_connected()).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.connection().id().as_deref(), Some("conn-test"));
    assert_eq!(client.connection().key().as_deref(), Some("key-test"));
    assert_eq!(
        client.recovery_key().as_deref(),
        Some("conn-test:key-test:-1")
    );
}

#[tokio::test]
async fn test_connect_url_carries_protocol_and_credentials() {
    let server = MockServer::new();
    let client = client_with(
        &server,
        test_options().client_id("alice").echo_messages(false),
    );

    client.connect().await.unwrap();
    wait_until("connected", || client.is_connected()).await;

    let url = server.last_url().unwrap();
    assert!(url.contains("v=1"), "missing protocol version: {}", url);
    assert!(url.contains("client=millrace-rust%2F"), "missing client: {}", url);
    assert!(url.contains("key=app.key%3Asecret"), "missing key: {}", url);
    assert!(url.contains("clientId=alice"), "missing clientId: {}", url);
    assert!(url.contains("echo=false"), "missing echo flag: {}", url);
}

#[tokio::test]
async fn test_refused_attempt_retries_and_recovers() {
    let server = MockServer::new();
    server.script(ConnectBehavior::Refuse("connection refused".to_string()));

    let states = Arc::new(Mutex::new(Vec::new()));
    let states_clone = states.clone();

    // auto_connect drives both the initial attempt and the retry
    let client = client_with(&server, test_options().auto_connect(true));
    client.connection().on_state_change(move |change| {
        states_clone.lock().push((change.current, change.retry_in));
    });

    wait_until("connected after retry", || client.is_connected()).await;

    assert!(server.connect_count() >= 2);
    let states = states.lock();
    let sequence: Vec<ConnectionState> = states.iter().map(|(state, _)| *state).collect();
    assert_eq!(
        sequence,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    // The failed attempt announced when it would retry
    let (_, retry_in) = states[1];
    assert!(retry_in.is_some());
}

#[tokio::test]
async fn test_silent_transport_times_out_and_retries() {
    let server = MockServer::new();
    // Opens but never sends CONNECTED
    server.script(ConnectBehavior::Open(vec![]));

    let client = client_with(&server, test_options().auto_connect(true));

    wait_until("connected after handshake timeout", || {
        client.is_connected()
    })
    .await;

    assert!(server.connect_count() >= 2);
}

#[tokio::test]
async fn test_resume_after_transport_drop() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    server.drop_connection(Some(1006), Some("connection reset"));
    wait_until("disconnected", || {
        client.state() == ConnectionState::Disconnected
    })
    .await;
    wait_until("reconnected", || client.is_connected()).await;

    let url = server.last_url().unwrap();
    assert!(url.contains("resume=key-test"), "missing resume: {}", url);
    assert!(
        url.contains("connectionSerial=-1"),
        "missing serial: {}",
        url
    );
    assert_eq!(client.connection().id().as_deref(), Some("conn-test"));
}

#[tokio::test]
async fn test_publish_while_disconnected_is_sent_after_reconnect() {
    let server = MockServer::new();
    server.set_auto_ack(true);

    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    let channel = client.channel("orders");
    server.inject(attached_frame("orders"));
    wait_until("attached", || channel.is_attached()).await;

    server.drop_connection(Some(1006), None);
    wait_until("disconnected", || {
        client.state() == ConnectionState::Disconnected
    })
    .await;
    server.clear_sent();

    // Queued at the connection while the retry is pending
    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("created", serde_json::json!({ "id": 7 })).await }
    });

    publish.await.unwrap().unwrap();

    let sent = server.sent();
    let message = sent
        .iter()
        .find(|frame| frame.action == Some(Action::Message))
        .expect("publish was never sent");
    assert_eq!(message.msg_serial, Some(0));
    assert_eq!(message.channel.as_deref(), Some("orders"));
}

#[tokio::test]
async fn test_fresh_session_resets_message_serials() {
    let server = MockServer::new();
    server.set_auto_ack(true);

    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    let channel = client.channel("orders");
    server.inject(attached_frame("orders"));
    wait_until("attached", || channel.is_attached()).await;

    channel
        .publish("created", serde_json::json!({ "id": 1 }))
        .await
        .unwrap();

    // Resume is rejected: the service assigns a brand new connection
    server.script(ConnectBehavior::Open(vec![connected_frame(
        "conn-new", "key-new",
    )]));
    server.drop_connection(Some(1006), None);
    wait_until("reconnected fresh", || {
        client.is_connected() && client.connection().id().as_deref() == Some("conn-new")
    })
    .await;
    server.clear_sent();

    channel
        .publish("created", serde_json::json!({ "id": 2 }))
        .await
        .unwrap();

    let sent = server.sent();
    let message = sent
        .iter()
        .find(|frame| frame.action == Some(Action::Message))
        .expect("publish was never sent");
    // Serials restart on a fresh session
    assert_eq!(message.msg_serial, Some(0));
}

#[tokio::test]
async fn test_suspension_after_retry_window() {
    let server = MockServer::new();
    server.script(ConnectBehavior::Refuse("no route".to_string()));

    let client = client_with(
        &server,
        test_options().suspend_after(Duration::from_millis(0)),
    );
    client.connect().await.unwrap();

    wait_until("suspended", || {
        client.state() == ConnectionState::Suspended
    })
    .await;

    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, codes::CONNECTION_SUSPENDED);
}

#[tokio::test]
async fn test_close_exchanges_close_and_closed() {
    let server = MockServer::new();
    let client = client_with(&server, test_options());
    client.connect().await.unwrap();
    wait_until("connected", || client.is_connected()).await;

    client.close().await.unwrap();
    wait_until("close frame sent", || {
        server.sent_actions().contains(&Action::Close)
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Closing);

    server.inject(millrace::ProtocolMessage {
        action: Some(Action::Closed),
        ..Default::default()
    });
    wait_until("closed", || client.state() == ConnectionState::Closed).await;

    assert!(client.connection().id().is_none());
    assert!(client.recovery_key().is_none());
}

#[tokio::test]
async fn test_close_times_out_into_closed() {
    let server = MockServer::new();
    let client = client_with(&server, test_options());
    client.connect().await.unwrap();
    wait_until("connected", || client.is_connected()).await;

    // Server never answers the CLOSE
    client.close().await.unwrap();
    wait_until("closed after timeout", || {
        client.state() == ConnectionState::Closed
    })
    .await;
}

#[tokio::test]
async fn test_close_before_connect_is_local() {
    let server = MockServer::new();
    let client = client_with(&server, test_options());

    client.close().await.unwrap();
    wait_until("closed", || client.state() == ConnectionState::Closed).await;

    assert_eq!(server.connect_count(), 0);
    assert!(server.sent().is_empty());
}

#[tokio::test]
async fn test_connection_error_frame_is_terminal() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    server.inject(error_frame(50001, Some(500), "Service unavailable"));
    wait_until("failed", || client.state() == ConnectionState::Failed).await;

    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, 50001);

    // An explicit connect() starts over
    client.connect().await.unwrap();
    wait_until("reconnected after failure", || client.is_connected()).await;
}

#[tokio::test]
async fn test_token_error_without_renewal_path_fails() {
    let server = MockServer::new();
    // Key auth cannot mint a fresh token
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    server.inject(error_frame(
        codes::TOKEN_EXPIRED,
        Some(401),
        "Token expired",
    ));
    wait_until("failed", || client.state() == ConnectionState::Failed).await;

    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, codes::TOKEN_EXPIRED);
}

#[tokio::test]
async fn test_token_renewed_once_then_terminal() {
    use futures::FutureExt;

    let server = MockServer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let callback = AuthCallback::new(move || {
        let n = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(TokenDetails::new(format!("token-{}", n))) }.boxed()
    });

    let options = millrace::MillraceOptions::with_token("placeholder")
        .auth_callback(callback)
        .auto_connect(true)
        .open_timeout(Duration::from_millis(300))
        .request_timeout(Duration::from_millis(300))
        .disconnected_retry_timeout(Duration::from_millis(50))
        .suspended_retry_timeout(Duration::from_millis(50));
    let client = client_with(&server, options);
    wait_until("connected", || client.is_connected()).await;
    assert!(server.last_url().unwrap().contains("accessToken=token-1"));

    // The renewed token is rejected during the next handshake
    server.script(ConnectBehavior::Open(vec![error_frame(
        codes::TOKEN_EXPIRED,
        Some(401),
        "Token expired",
    )]));
    server.inject(error_frame(
        codes::TOKEN_EXPIRED,
        Some(401),
        "Token expired",
    ));

    wait_until("failed after one renewal", || {
        client.state() == ConnectionState::Failed
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(server.last_url().unwrap().contains("accessToken=token-2"));
    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, codes::TOKEN_EXPIRED);
}

#[tokio::test]
async fn test_nack_rejects_publish() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    let channel = client.channel("orders");
    server.inject(attached_frame("orders"));
    wait_until("attached", || channel.is_attached()).await;

    let publish = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("created", serde_json::json!({})).await }
    });
    wait_until("publish sent", || {
        server.sent_actions().contains(&Action::Message)
    })
    .await;

    server.inject(nack_frame(
        0,
        1,
        ErrorInfo::new(40160, Some(403), "Publish not permitted"),
    ));

    let result = publish.await.unwrap();
    match result {
        Err(MillraceError::ServiceError { info }) => assert_eq!(info.code, 40160),
        other => panic!("Expected service error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ack_ranges_resolve_in_flight_publishes() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    let channel = client.channel("orders");
    server.inject(attached_frame("orders"));
    wait_until("attached", || channel.is_attached()).await;

    let mut publishes = Vec::new();
    for i in 0..3usize {
        let expected = i + 1;
        publishes.push(tokio::spawn({
            let channel = channel.clone();
            async move { channel.publish("created", serde_json::json!({ "n": i })).await }
        }));
        wait_until("publish on the wire", || {
            server
                .sent_actions()
                .iter()
                .filter(|action| **action == Action::Message)
                .count()
                == expected
        })
        .await;
    }

    // One ACK covers the first two; the third is rejected
    server.inject(ack_frame(0, 2));
    server.inject(nack_frame(2, 1, ErrorInfo::new(50000, Some(500), "Overloaded")));

    let first = publishes.remove(0).await.unwrap();
    let second = publishes.remove(0).await.unwrap();
    let third = publishes.remove(0).await.unwrap();
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(third.is_err());
}

#[tokio::test]
async fn test_queueing_disabled_rejects_offline_publish() {
    let server = MockServer::new();
    server.set_auto_ack(true);

    let client = client_with(
        &server,
        test_options().auto_connect(true).queue_messages(false),
    );
    wait_until("connected", || client.is_connected()).await;

    let channel = client.channel("orders");
    server.inject(attached_frame("orders"));
    wait_until("attached", || channel.is_attached()).await;

    server.drop_connection(Some(1006), None);
    wait_until("disconnected", || {
        client.state() == ConnectionState::Disconnected
    })
    .await;

    let result = channel.publish("created", serde_json::json!({})).await;
    let error = result.expect_err("publish should be refused while offline");
    assert!(
        error.to_string().contains("queueing is disabled"),
        "unexpected error: {}",
        error
    );
}

#[tokio::test]
async fn test_network_down_hint_drops_and_reconnects() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    client.connection().on_network_unavailable().await.unwrap();
    wait_until("disconnected", || {
        client.state() == ConnectionState::Disconnected
    })
    .await;
    wait_until("reconnected", || client.is_connected()).await;

    assert!(server.connect_count() >= 2);
}

#[tokio::test]
async fn test_heartbeat_keeps_connection_untouched() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;

    server.inject(millrace::ProtocolMessage {
        action: Some(Action::Heartbeat),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_recovery_key_round_trip() {
    let server = MockServer::new();
    let client = client_with(&server, test_options().auto_connect(true));
    wait_until("connected", || client.is_connected()).await;
    let recovery_key = client.recovery_key().unwrap();
    drop(client);

    // A brand new client presents the recovery key on its first attempt
    let server = MockServer::new();
    let client = client_with(
        &server,
        test_options().auto_connect(true).recover(recovery_key),
    );
    wait_until("recovered", || client.is_connected()).await;

    let url = server.last_url().unwrap();
    assert!(url.contains("resume=key-test"), "missing resume: {}", url);
    assert!(
        url.contains("connectionSerial=-1"),
        "missing serial: {}",
        url
    );
}
