//! End-to-end scenarios run against real loopback TCP sockets.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tofulink::handshake::{run_client_handshake, run_server_handshake};
use tofulink::{
    BufferPool, Client, ClientConfig, Packet, PacketIdentifier, ProtocolConfig, RateLimitConfig,
    Router, Server, ServerConfig, ServerConnection, ServerIdentity, SystemPacketType, TrustStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ECHO: u32 = 101;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tofulink-e2e-{name}-{}.json", uuid::Uuid::new_v4()))
}

async fn bind_loopback() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn happy_path_echo_round_trip() {
    let identity_path = temp_path("happy-identity");
    let trust_path = temp_path("happy-trust");

    let server_router: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    server_router.register(
        PacketIdentifier::application(ECHO).unwrap(),
        Some(Arc::new(|connection: Arc<ServerConnection>, packet: Packet| {
            Box::pin(async move {
                let reply = Packet::plaintext(packet.identifier(), packet.into_payload());
                connection.send(reply).await.unwrap();
            })
        })),
    );
    let server = Server::new(
        ServerConfig {
            identity_path: identity_path.clone(),
            ..ServerConfig::default()
        },
        server_router,
    )
    .unwrap();
    let (listener, addr) = bind_loopback().await;
    let server_run = server.clone();
    tokio::spawn(async move {
        server_run.run(listener, |_| {}, |_| {}).await;
    });

    let replies = Arc::new(AtomicUsize::new(0));
    let replies2 = replies.clone();
    let client_router: Arc<Router<()>> = Arc::new(Router::new());
    client_router.register(
        PacketIdentifier::application(ECHO).unwrap(),
        Some(Arc::new(move |_ctx: (), packet: Packet| {
            let replies = replies2.clone();
            Box::pin(async move {
                assert_eq!(packet.payload(), b"Hello");
                replies.fetch_add(1, Ordering::SeqCst);
            })
        })),
    );
    let client = Client::new(
        ClientConfig {
            trust_store_path: trust_path.clone(),
            ..ClientConfig::default()
        },
        client_router,
    )
    .unwrap();
    client
        .connect(&addr.ip().to_string(), addr.port(), (), || {})
        .await
        .unwrap();

    client
        .send(Packet::new(
            PacketIdentifier::application(ECHO).unwrap(),
            true,
            b"Hello".to_vec(),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(replies.load(Ordering::SeqCst), 1);

    // Fingerprint is now on file.
    let trust_store = TrustStore::load(&trust_path).unwrap();
    assert!(trust_store
        .pinned_fingerprint(&addr.ip().to_string(), addr.port())
        .is_some());

    client.disconnect(None).await;
    server.shutdown();
    std::fs::remove_file(&identity_path).ok();
    std::fs::remove_file(&trust_path).ok();
}

#[tokio::test]
async fn tofu_mismatch_rejects_and_leaves_trust_file_untouched() {
    let identity_a = temp_path("tofu-identity-a");
    let identity_b = temp_path("tofu-identity-b");
    let trust_path = temp_path("tofu-trust");

    let router_a: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    let server_a = Server::new(
        ServerConfig {
            identity_path: identity_a.clone(),
            ..ServerConfig::default()
        },
        router_a,
    )
    .unwrap();
    let (listener_a, addr) = bind_loopback().await;
    let server_a_run = server_a.clone();
    let run_a = tokio::spawn(async move {
        server_a_run.run(listener_a, |_| {}, |_| {}).await;
    });

    let client_router: Arc<Router<()>> = Arc::new(Router::new());
    let client = Client::new(
        ClientConfig {
            trust_store_path: trust_path.clone(),
            ..ClientConfig::default()
        },
        client_router.clone(),
    )
    .unwrap();
    client
        .connect(&addr.ip().to_string(), addr.port(), (), || {})
        .await
        .unwrap();
    client.disconnect(None).await;
    server_a.shutdown();
    run_a.await.unwrap();

    let file_before = std::fs::read(&trust_path).unwrap();

    // Second server, same address, fresh identity.
    let router_b: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    let server_b = Server::new(
        ServerConfig {
            identity_path: identity_b.clone(),
            ..ServerConfig::default()
        },
        router_b,
    )
    .unwrap();
    let listener_b = TcpListener::bind(addr).await.unwrap();
    let server_b_run = server_b.clone();
    let run_b = tokio::spawn(async move {
        server_b_run.run(listener_b, |_| {}, |_| {}).await;
    });

    let client2 = Client::new(
        ClientConfig {
            trust_store_path: trust_path.clone(),
            ..ClientConfig::default()
        },
        client_router,
    )
    .unwrap();
    let result = client2
        .connect(&addr.ip().to_string(), addr.port(), (), || {})
        .await;
    assert!(result.is_err());

    let file_after = std::fs::read(&trust_path).unwrap();
    assert_eq!(file_before, file_after);

    server_b.shutdown();
    run_b.await.unwrap();
    std::fs::remove_file(&identity_a).ok();
    std::fs::remove_file(&identity_b).ok();
    std::fs::remove_file(&trust_path).ok();
}

/// Proxies raw frames between a client and the real server, corrupting the
/// last byte of the `n`th frame sent server -> client (0-indexed), which
/// lands inside the handshake signature (`signature` is the last field of
/// the server's handshake payload, so the final byte of any frame carrying
/// it is always one of its bytes).
async fn run_tampering_proxy(listener: TcpListener, server_addr: std::net::SocketAddr, tamper_frame_index: usize) {
    let (mut client_side, _) = listener.accept().await.unwrap();
    let mut server_side = TcpStream::connect(server_addr).await.unwrap();

    let client_to_server = async {
        let mut buf = [0u8; 4096];
        loop {
            match client_side.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if server_side.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let server_to_client = async {
        let mut frame_index = 0usize;
        loop {
            let mut prefix = [0u8; 4];
            if server_side.read_exact(&mut prefix).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(prefix) as usize;
            let mut payload = vec![0u8; len];
            if len > 0 && server_side.read_exact(&mut payload).await.is_err() {
                break;
            }
            if frame_index == tamper_frame_index {
                if let Some(last) = payload.last_mut() {
                    *last ^= 0xFF;
                }
            }
            frame_index += 1;
            if client_side.write_all(&prefix).await.is_err() {
                break;
            }
            if client_side.write_all(&payload).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_server => {}
        _ = server_to_client => {}
    }
}

#[tokio::test]
async fn mitm_tampered_signature_aborts_the_handshake() {
    let identity_path = temp_path("mitm-identity");
    let identity = ServerIdentity::load_or_generate(&identity_path).unwrap();
    let pool = BufferPool::new(4);

    let (server_listener, server_addr) = bind_loopback().await;
    let server_task = tokio::spawn(async move {
        let (mut stream, _) = server_listener.accept().await.unwrap();
        let _ = run_server_handshake(&mut stream, &identity, 65536, &pool).await;
    });

    let (proxy_listener, proxy_addr) = bind_loopback().await;
    // The server's second frame (index 1) is the ephemeral-key-plus-signature message.
    let proxy_task = tokio::spawn(run_tampering_proxy(proxy_listener, server_addr, 1));

    let trust_path = temp_path("mitm-trust");
    let trust_store = TrustStore::load(&trust_path).unwrap();
    let pool = BufferPool::new(4);
    let mut client_stream = TcpStream::connect(proxy_addr).await.unwrap();
    let result = run_client_handshake(
        &mut client_stream,
        "127.0.0.1",
        server_addr.port(),
        &trust_store,
        65536,
        &pool,
    )
    .await;

    assert!(matches!(
        result,
        Err(tofulink::Error::Identity(tofulink::IdentityError::BadSignature))
    ));

    server_task.await.ok();
    proxy_task.abort();
    std::fs::remove_file(&identity_path).ok();
    std::fs::remove_file(&trust_path).ok();
}

#[tokio::test]
async fn idle_connection_is_disconnected_after_keepalive_timeout() {
    let identity_path = temp_path("keepalive-identity");

    let router: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    let server = Server::new(
        ServerConfig {
            identity_path: identity_path.clone(),
            protocol: ProtocolConfig {
                keepalive_interval: Duration::from_millis(40),
                keepalive_timeout: Duration::from_millis(120),
                ..ProtocolConfig::default()
            },
            ..ServerConfig::default()
        },
        router,
    )
    .unwrap();
    let (listener, addr) = bind_loopback().await;
    let server_run = server.clone();
    tokio::spawn(async move {
        server_run.run(listener, |_| {}, |_| {}).await;
    });

    // A raw client that completes the handshake, then goes silent — it never
    // reads or writes again, simulating a stalled peer.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let trust_path = temp_path("keepalive-trust");
    let trust_store = TrustStore::load(&trust_path).unwrap();
    let pool = BufferPool::new(4);
    run_client_handshake(&mut stream, "127.0.0.1", addr.port(), &trust_store, 65536, &pool)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.connected_client_count(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connected_client_count(), 0);

    std::fs::remove_file(&identity_path).ok();
    std::fs::remove_file(&trust_path).ok();
}

#[tokio::test]
async fn rate_limit_burst_disconnects_after_delivering_the_reason() {
    let identity_path = temp_path("ratelimit-identity");

    let router: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    let server = Server::new(
        ServerConfig {
            identity_path: identity_path.clone(),
            rate_limit: RateLimitConfig {
                packets_per_second: 5.0,
                packets_burst: 40.0,
                bytes_per_second: 500.0,
                bytes_burst: 2000.0,
            },
            ..ServerConfig::default()
        },
        router,
    )
    .unwrap();
    let (listener, addr) = bind_loopback().await;
    let server_run = server.clone();
    tokio::spawn(async move {
        server_run.run(listener, |_| {}, |_| {}).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let trust_path = temp_path("ratelimit-trust");
    let trust_store = TrustStore::load(&trust_path).unwrap();
    let pool = BufferPool::new(4);
    let outcome = run_client_handshake(&mut stream, "127.0.0.1", addr.port(), &trust_store, 65536, &pool)
        .await
        .unwrap();

    for _ in 0..100 {
        let mut packet = Packet::plaintext(
            PacketIdentifier::application(ECHO).unwrap(),
            vec![0u8; 50],
        );
        outcome.cipher.encrypt_packet(&mut packet);
        let bytes = packet.encode().unwrap().to_vec();
        tofulink::framing::write_frame(&mut stream, &bytes).await.unwrap();
    }

    // Read frames until we see the Disconnect, then confirm the socket closes.
    let mut saw_disconnect = false;
    for _ in 0..200 {
        let mut prefix = [0u8; 4];
        if stream.read_exact(&mut prefix).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && stream.read_exact(&mut payload).await.is_err() {
            break;
        }
        if len == 0 {
            continue;
        }
        let mut packet = Packet::decode(&payload).unwrap();
        if packet.encrypted() {
            outcome.cipher.decrypt_packet(&mut packet).unwrap();
        }
        if SystemPacketType::from_identifier(packet.identifier()) == Some(SystemPacketType::Disconnect) {
            saw_disconnect = true;
            break;
        }
    }
    assert!(saw_disconnect, "expected a Disconnect packet before the socket closed");

    let mut trailing = [0u8; 1];
    let eof = stream.read(&mut trailing).await.unwrap();
    assert_eq!(eof, 0);

    std::fs::remove_file(&identity_path).ok();
    std::fs::remove_file(&trust_path).ok();
}

#[tokio::test]
async fn graceful_shutdown_drains_cooperative_clients_and_forces_the_laggard() {
    let identity_path = temp_path("shutdown-identity");
    let router: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    let server = Server::new(
        ServerConfig {
            identity_path: identity_path.clone(),
            shutdown_grace: Duration::from_millis(300),
            ..ServerConfig::default()
        },
        router,
    )
    .unwrap();
    let (listener, addr) = bind_loopback().await;
    let server_run = server.clone();
    let run_task = tokio::spawn(async move {
        server_run.run(listener, |_| {}, |_| {}).await;
    });

    let mut clients = Vec::new();
    for i in 0..9 {
        let trust_path = temp_path(&format!("shutdown-trust-{i}"));
        let client_router: Arc<Router<()>> = Arc::new(Router::new());
        let client = Client::new(
            ClientConfig {
                trust_store_path: trust_path.clone(),
                ..ClientConfig::default()
            },
            client_router,
        )
        .unwrap();
        client
            .connect(&addr.ip().to_string(), addr.port(), (), || {})
            .await
            .unwrap();
        clients.push((client, trust_path));
    }

    // The tenth client: completes the handshake, then never reads again.
    let mut laggard_stream = TcpStream::connect(addr).await.unwrap();
    let laggard_trust_path = temp_path("shutdown-trust-laggard");
    let laggard_trust_store = TrustStore::load(&laggard_trust_path).unwrap();
    let pool = BufferPool::new(4);
    run_client_handshake(
        &mut laggard_stream,
        "127.0.0.1",
        addr.port(),
        &laggard_trust_store,
        65536,
        &pool,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connected_client_count(), 10);

    server.shutdown();
    run_task.await.unwrap();
    assert_eq!(server.connected_client_count(), 0);

    for (client, trust_path) in clients {
        client.disconnect(None).await;
        std::fs::remove_file(&trust_path).ok();
    }
    std::fs::remove_file(&identity_path).ok();
    std::fs::remove_file(&laggard_trust_path).ok();
}
