//! Integration tests for the TLS handshake over real loopback sockets.
//!
//! Every listener binds port 0; the remote identity is then built from the
//! address the OS picked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use peertls::{
    connect, connect_with, listen, Address, Conn, DialConfig, Ed25519Suite, Error, ServerIdentity,
    Suite, TlsListener, VerifyError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

type Identity = ServerIdentity<Ed25519Suite>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn suite() -> Arc<Ed25519Suite> {
    Arc::new(Ed25519Suite)
}

fn local_identity(suite: &Ed25519Suite) -> Arc<Identity> {
    Arc::new(ServerIdentity::generate(
        suite,
        "tls://127.0.0.1:0".parse().unwrap(),
    ))
}

/// Listener for `us`, plus the identity a client should dial.
async fn bind(us: &Arc<Identity>, suite: &Arc<Ed25519Suite>) -> (TlsListener<Ed25519Suite>, Identity) {
    let listener = listen(us, suite, "127.0.0.1:0").await.expect("listen failed");
    let addr = Address::tls(listener.local_addr());
    let remote = ServerIdentity::new(*us.public(), addr);
    (listener, remote)
}

fn fast_fail() -> DialConfig {
    DialConfig::default()
        .max_retries(1)
        .handshake_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn client_and_server_authenticate_each_other() {
    let suite = suite();
    let node_a = local_identity(&suite);
    let node_b = local_identity(&suite);
    let (listener, a_remote) = bind(&node_a, &suite).await;

    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.expect("accept failed");
        let packet = conn.receive().await.expect("receive failed");
        conn.send(&packet).await.expect("send failed");
        conn
    });

    let mut client = timeout(TEST_TIMEOUT, connect(&node_b, &a_remote, &suite))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(client.peer_public(), node_a.public());

    client.send(b"ping").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"ping");
    assert_eq!(client.tx(), 8);
    assert_eq!(client.rx(), 8);

    let server_conn: Conn<Ed25519Suite> = server.await.unwrap();
    assert_eq!(server_conn.peer_public(), node_b.public());
    assert_eq!(server_conn.remote_addr(), client.local_addr());
}

#[tokio::test]
async fn server_accepts_any_valid_proof() {
    let suite = suite();
    let node_a = local_identity(&suite);
    let (listener, a_remote) = bind(&node_a, &suite).await;

    // An identity A has never heard of, with a matching private key.
    let stranger = local_identity(&suite);

    let server = tokio::spawn(async move { listener.accept().await });
    let client = connect_with(&stranger, &a_remote, &suite, &fast_fail())
        .await
        .expect("stranger should be accepted");
    assert_eq!(client.peer_public(), node_a.public());

    let accepted = server.await.unwrap().expect("accept failed");
    assert_eq!(accepted.peer_public(), stranger.public());
}

#[tokio::test]
async fn server_rejects_proof_for_a_key_the_client_does_not_hold() {
    let suite = suite();
    let node_a = local_identity(&suite);
    let (listener, a_remote) = bind(&node_a, &suite).await;

    // Claims an unrelated public key but signs with its own private key.
    let unrelated = suite.public_from_secret(&suite.generate_secret());
    let impostor = Arc::new(ServerIdentity::from_parts(
        unrelated,
        Some(suite.generate_secret()),
        "tls://127.0.0.1:0".parse().unwrap(),
    ));
    let honest = local_identity(&suite);

    let server = tokio::spawn(async move { listener.accept().await });

    let err = connect_with(&impostor, &a_remote, &suite, &fast_fail())
        .await
        .expect_err("impostor must be rejected");
    assert!(matches!(err, Error::ConnectTimeout { attempts: 1, .. }));

    // The listener keeps serving after a rejected handshake.
    let conn = connect_with(&honest, &a_remote, &suite, &fast_fail())
        .await
        .expect("honest client must be accepted");
    assert_eq!(conn.peer_public(), node_a.public());

    let accepted = timeout(TEST_TIMEOUT, server)
        .await
        .expect("accept timed out")
        .unwrap()
        .unwrap();
    assert_eq!(accepted.peer_public(), honest.public());
}

#[tokio::test]
async fn client_rejects_unexpected_server_identity() {
    let suite = suite();
    let node_a = local_identity(&suite);
    let node_b = local_identity(&suite);
    let (listener, a_remote) = bind(&node_a, &suite).await;

    let _server = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let expected_other = local_identity(&suite);
    let wrong = ServerIdentity::new(*expected_other.public(), a_remote.address().clone());

    let err = connect_with(&node_b, &wrong, &suite, &fast_fail())
        .await
        .expect_err("identity mismatch must fail");
    assert!(
        matches!(err.verify_error(), Some(VerifyError::IdentityMismatch { .. })),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn idle_socket_does_not_hold_up_other_handshakes() {
    let suite = suite();
    let server_id = local_identity(&suite);
    let client_id = local_identity(&suite);
    let (listener, remote) = bind(&server_id, &suite).await;

    // Connects but never sends a ClientHello.
    let _idle = TcpStream::connect(listener.local_addr()).await.unwrap();

    let config = DialConfig::default()
        .max_retries(1)
        .handshake_timeout(Duration::from_secs(3));
    let started = Instant::now();
    let (accepted, dialed) = tokio::join!(
        listener.accept(),
        connect_with(&client_id, &remote, &suite, &config)
    );

    let dialed = dialed.expect("honest client must not wait behind the idle socket");
    assert_eq!(dialed.peer_public(), server_id.public());
    assert_eq!(accepted.unwrap().peer_public(), client_id.public());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn dropped_listener_ends_pending_handshakes() {
    let suite = suite();
    let server_id = local_identity(&suite);
    let client_id = local_identity(&suite);
    let (listener, remote) = bind(&server_id, &suite).await;
    drop(listener);

    let config = DialConfig::default()
        .max_retries(2)
        .retry_delay(Duration::from_millis(50))
        .handshake_timeout(Duration::from_secs(2));
    let err = timeout(TEST_TIMEOUT, connect_with(&client_id, &remote, &suite, &config))
        .await
        .expect("connect must not hang")
        .expect_err("nobody is accepting");
    assert!(matches!(err, Error::ConnectTimeout { attempts: 2, .. }));
}

#[tokio::test]
async fn retries_are_exhausted_against_a_dead_address() {
    let suite = suite();
    let us = local_identity(&suite);

    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    let them = ServerIdentity::new(
        suite.public_from_secret(&suite.generate_secret()),
        Address::tls(dead_addr),
    );

    let retries = 3;
    let delay = Duration::from_millis(100);
    let config = DialConfig::default()
        .max_retries(retries)
        .retry_delay(delay)
        .dial_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let err = timeout(TEST_TIMEOUT, connect_with(&us, &them, &suite, &config))
        .await
        .expect("connect must not hang")
        .expect_err("nothing is listening");

    assert!(started.elapsed() >= delay * (retries - 1));
    match err {
        Error::ConnectTimeout { attempts, source, .. } => {
            assert_eq!(attempts, retries);
            assert!(matches!(*source, Error::Io(_)));
        }
        other => panic!("expected ConnectTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn configuration_errors_are_not_retried() {
    let suite = suite();
    let us = local_identity(&suite);
    let slow = DialConfig::default()
        .max_retries(50)
        .retry_delay(Duration::from_secs(1));

    let tcp_peer = ServerIdentity::new(*us.public(), "tcp://127.0.0.1:1".parse().unwrap());
    let started = Instant::now();
    let err = connect_with(&us, &tcp_peer, &suite, &slow).await.unwrap_err();
    assert!(matches!(err, Error::NotTls { .. }));
    assert!(err.is_configuration());

    let no_key = Arc::new(us.public_view());
    let tls_peer = ServerIdentity::new(*us.public(), "tls://127.0.0.1:1".parse().unwrap());
    let err = connect_with(&no_key, &tls_peer, &suite, &slow).await.unwrap_err();
    assert!(matches!(err, Error::MissingPrivateKey));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn listen_requires_private_key() {
    let suite = suite();
    let us = local_identity(&suite);
    let no_key = Arc::new(us.public_view());

    assert!(matches!(
        listen(&no_key, &suite, "127.0.0.1:0").await,
        Err(Error::MissingPrivateKey)
    ));
}

#[tokio::test]
async fn serve_handles_concurrent_clients_until_shutdown() {
    let suite = suite();
    let server_id = local_identity(&suite);
    let (listener, remote) = bind(&server_id, &suite).await;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let serving = tokio::spawn(listener.serve(
        |mut conn| async move {
            while let Ok(packet) = conn.receive().await {
                if conn.send(&packet).await.is_err() {
                    break;
                }
            }
        },
        async move {
            let _ = stop_rx.await;
        },
    ));

    let remote = Arc::new(remote);
    let mut clients = Vec::new();
    for i in 0..8u8 {
        let suite = Arc::clone(&suite);
        let remote = Arc::clone(&remote);
        clients.push(tokio::spawn(async move {
            let us = local_identity(&suite);
            let mut conn = connect(&us, &remote, &suite).await.expect("connect failed");
            conn.send(&[i; 16]).await.unwrap();
            assert_eq!(conn.receive().await.unwrap(), vec![i; 16]);
        }));
    }
    for client in clients {
        timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    }

    stop_tx.send(()).unwrap();
    timeout(TEST_TIMEOUT, serving)
        .await
        .expect("serve did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn oversized_packets_are_refused() {
    let suite = suite();
    let server_id = local_identity(&suite);
    let client_id = local_identity(&suite);
    let (listener, remote) = bind(&server_id, &suite).await;

    let server = tokio::spawn(async move { listener.accept().await.unwrap() });
    let config = DialConfig::default().max_packet_size(8);
    let mut conn = connect_with(&client_id, &remote, &suite, &config).await.unwrap();

    assert!(matches!(
        conn.send(&[0u8; 9]).await,
        Err(Error::PacketTooLarge { size: 9, max: 8 })
    ));
    drop(server.await.unwrap());
}
