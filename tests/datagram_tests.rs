//! Relay over the secure datagram transport.

use relaymux_core::RelayError;
use relaymux_integration_tests::{RelayFixture, pattern, peer, read_exact};
use relaymux_transport::{
    Connection, DatagramDialer, DatagramListener, Dialer, Listener, NORMAL_CLOSURE, SessionKey,
    TransportError,
};
use std::time::Duration;

const PROMPT: Duration = Duration::from_secs(5);

fn key() -> SessionKey {
    SessionKey::derive(b"integration secret")
}

#[tokio::test]
async fn test_round_trip_over_datagrams() {
    let relay = RelayFixture::start_datagram(key()).await;
    let alice = relay.connected_client("alice").await;
    let bob = relay.connected_client("bob").await;

    let to_bob = alice.open_conn(&peer("bob")).unwrap();
    // Several payloads, each well below one datagram
    let payload = pattern(12_000);
    for chunk in payload.chunks(1_000) {
        to_bob.write(chunk).await.unwrap();
    }

    let from_alice = tokio::time::timeout(PROMPT, bob.accept())
        .await
        .unwrap()
        .unwrap();
    let received = tokio::time::timeout(PROMPT, read_exact(&from_alice, payload.len()))
        .await
        .unwrap();
    assert_eq!(received, payload);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_echo_over_datagrams() {
    let relay = RelayFixture::start_datagram(key()).await;
    let alice = relay.connected_client("alice").await;
    let bob = relay.connected_client("bob").await;

    let echo = tokio::spawn(async move {
        let conn = bob.accept().await.unwrap();
        let mut buf = vec![0u8; 2048];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => conn.write(&buf[..n]).await.unwrap(),
            };
        }
        bob
    });

    let conn = alice.open_conn(&peer("bob")).unwrap();
    conn.write(b"ping over udp").await.unwrap();
    let echoed = tokio::time::timeout(PROMPT, read_exact(&conn, 13))
        .await
        .unwrap();
    assert_eq!(echoed, b"ping over udp");

    conn.close().await.unwrap();
    let bob = tokio::time::timeout(PROMPT, echo).await.unwrap().unwrap();

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_remote_stream_close_reads_eof() {
    let relay = RelayFixture::start_datagram(key()).await;
    let alice = relay.connected_client("alice").await;
    let bob = relay.connected_client("bob").await;

    let conn = alice.open_conn(&peer("bob")).unwrap();
    conn.write(b"bye").await.unwrap();

    let at_bob = bob.accept().await.unwrap();
    assert_eq!(read_exact(&at_bob, 3).await, b"bye");

    conn.close().await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(PROMPT, at_bob.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(matches!(
        at_bob.write(b"too late").await,
        Err(RelayError::ConnClosed)
    ));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_session_close_codes() {
    let listener = DatagramListener::bind("127.0.0.1:0", key()).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let dialer = DatagramDialer::new(key());

    // Normal closure reads as EOF
    let client = dialer.dial(&addr).await.unwrap();
    client.write(b"hello").await.unwrap();
    let server = listener.accept().await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).await.unwrap(), 5);
    client.close().await.unwrap();
    let n = tokio::time::timeout(PROMPT, server.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // Anything else is an error carrying the code
    let client = dialer.connect(&addr).await.unwrap();
    client.write(b"again").await.unwrap();
    let server = listener.accept().await.unwrap();
    assert_eq!(server.read(&mut buf).await.unwrap(), 5);
    client.close_with(NORMAL_CLOSURE + 7, "going away").await.unwrap();
    match tokio::time::timeout(PROMPT, server.read(&mut buf)).await.unwrap() {
        Err(TransportError::RemoteClosed { code, reason }) => {
            assert_eq!(code, 7);
            assert_eq!(reason, "going away");
        }
        other => panic!("expected remote close, got {other:?}"),
    }

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_key_never_registers() {
    let relay = RelayFixture::start_datagram(key()).await;

    let intruder = relaymux_core::RelayClient::with_config(
        relay.addr.clone(),
        peer("intruder"),
        relaymux_core::RelayClientConfig {
            registration_timeout: Duration::from_millis(300),
            ..relaymux_core::RelayClientConfig::default()
        },
        std::sync::Arc::new(DatagramDialer::new(SessionKey::derive(b"wrong secret"))),
    );

    assert!(matches!(
        intruder.connect().await,
        Err(RelayError::RegistrationTimeout)
    ));
    assert_eq!(relay.server.client_count().await, 0);

    relay.shutdown().await;
}
