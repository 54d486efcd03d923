//! Loopback exercise of the QUIC session: handshake with a pinned CA,
//! registration frames, echo round trip, and symmetric request streams.

use std::collections::HashMap;
use std::path::PathBuf;

use globalping::probe::pinger::{PingEvent, PingEventKind};
use globalping::probe::ProbeRequest;
use globalping::session::frames::{EchoDirection, EchoPayload, MessagePayload};
use globalping::session::{self, auth, FrameReader, ServerAuthMode};

const SECRET: &[u8] = b"loopback-test-secret";

/// Write a fresh self-signed certificate pair as PEM files.
fn write_test_cert() -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed generation");

    let dir = std::env::temp_dir();
    let tag = uuid::Uuid::new_v4();
    let cert_path = dir.join(format!("globalping-test-{tag}.pem"));
    let key_path = dir.join(format!("globalping-test-{tag}-key.pem"));

    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    (cert_path, key_path)
}

#[tokio::test]
async fn registration_echo_and_dispatch_streams() {
    let (cert_path, key_path) = write_test_cert();

    let server = session::server_endpoint(
        "127.0.0.1:0".parse().unwrap(),
        Some((cert_path.as_path(), key_path.as_path())),
        &[],
        ServerAuthMode::Jwt,
    )
    .unwrap();
    let server_addr = server.local_addr().unwrap();

    // Hub side: accept the session, validate the bearer, answer the ping,
    // then open a dispatch stream of its own and read the event lines.
    let hub = tokio::spawn(async move {
        let connection = server
            .accept()
            .await
            .expect("incoming connection")
            .await
            .expect("handshake");

        let (mut send, recv) = connection.accept_bi().await.expect("registration stream");
        let mut reader = FrameReader::new(recv);

        // Frame order: auth, register, echo ping.
        let frame: MessagePayload = reader.next_frame().await.unwrap().unwrap();
        let bearer = frame.auth.expect("auth frame first").bearer;
        auth::verify_token(SECRET, &bearer).expect("valid bearer");

        let frame: MessagePayload = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.register.expect("register frame").node_name, "node-t");

        let frame: MessagePayload = reader.next_frame().await.unwrap().unwrap();
        let echo = frame.echo.expect("echo frame");
        assert_eq!(echo.direction, EchoDirection::Ping);
        let pong = MessagePayload::echo(echo.pong(echo.timestamp + 5));
        session::write_frame(&mut send, &pong).await.unwrap();

        // Symmetric direction: the hub opens a request stream.
        let (mut task_send, task_recv) = connection.open_bi().await.expect("dispatch stream");
        let request = ProbeRequest::Dnsprobe { targets: vec![] };
        session::write_frame(&mut task_send, &request).await.unwrap();
        task_send.finish().unwrap();

        let mut task_reader = FrameReader::new(task_recv);
        let mut events = Vec::new();
        while let Some(event) = task_reader.next_frame::<PingEvent>().await.unwrap() {
            events.push(event);
        }
        events
    });

    // Agent side.
    let endpoint = session::client_endpoint(&[cert_path.clone()], None, false).unwrap();
    let connection = session::connect(&endpoint, server_addr, "localhost")
        .await
        .unwrap();

    let (mut send, recv) = connection.open_bi().await.unwrap();
    let mut reader = FrameReader::new(recv);

    let token = auth::sign_token(SECRET, "globalping-hub", "test").unwrap();
    session::write_frame(&mut send, &MessagePayload::auth(token))
        .await
        .unwrap();
    session::write_frame(&mut send, &MessagePayload::register("node-t"))
        .await
        .unwrap();
    session::write_frame(
        &mut send,
        &MessagePayload::echo(EchoPayload {
            direction: EchoDirection::Ping,
            correlation_id: "corr-1".into(),
            server_timestamp: 0,
            timestamp: 1_000,
            seq_id: 42,
        }),
    )
    .await
    .unwrap();

    // Pong preserves correlation id and sequence, flips direction.
    let frame: MessagePayload = reader.next_frame().await.unwrap().unwrap();
    let pong = frame.echo.expect("pong frame");
    assert_eq!(pong.direction, EchoDirection::Pong);
    assert_eq!(pong.correlation_id, "corr-1");
    assert_eq!(pong.seq_id, 42);
    assert_eq!(pong.timestamp, 1_000);
    assert_eq!(pong.server_timestamp, 1_005);

    // Serve the hub-opened dispatch stream: read the request, stream two
    // events back, close.
    let (mut task_send, task_recv) = connection.accept_bi().await.unwrap();
    let mut task_reader = FrameReader::new(task_recv);
    let request: ProbeRequest = task_reader.next_frame().await.unwrap().unwrap();
    assert!(matches!(request, ProbeRequest::Dnsprobe { .. }));

    let metadata = HashMap::from([("from".to_string(), "node-t".to_string())]);
    for text in ["first", "second"] {
        let event = PingEvent::error(text, &metadata);
        session::write_frame(&mut task_send, &event).await.unwrap();
    }
    task_send.finish().unwrap();

    let events = hub.await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.kind == PingEventKind::Error));
    assert_eq!(events[0].err.as_deref(), Some("first"));
    assert_eq!(events[0].metadata.get("from").map(String::as_str), Some("node-t"));

    let _ = std::fs::remove_file(cert_path);
    let _ = std::fs::remove_file(key_path);
}

#[tokio::test]
async fn invalid_bearer_is_rejected() {
    let (cert_path, key_path) = write_test_cert();

    let token = auth::sign_token(b"a-different-secret", "hub", "x").unwrap();
    assert!(auth::verify_token(SECRET, &token).is_err());

    let _ = std::fs::remove_file(cert_path);
    let _ = std::fs::remove_file(key_path);
}
