//! Client-side connection and session management (spec.md §4.L).

use crate::aead::SessionCipher;
use crate::buffer_pool::BufferPool;
use crate::config::ClientConfig;
use crate::error::{Error, TransportError, UsageError};
use crate::framing::{read_frame, write_frame, Frame};
use crate::handshake::run_client_handshake;
use crate::packet::{Packet, SystemPacketType};
use crate::router::Router;
use crate::trust::TrustStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// The send-side handle for the single active session. Symmetric to
/// [`crate::connection::server::ServerConnection`].
struct ClientConnection {
    write_half: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    cipher: SessionCipher,
    closed: AtomicBool,
}

impl ClientConnection {
    async fn send(&self, mut packet: Packet) -> Result<(), Error> {
        self.cipher.encrypt_packet(&mut packet);
        let bytes = packet.encode()?;
        let mut write_half = self.write_half.lock().await;
        write_frame(&mut *write_half, bytes).await?;
        Ok(())
    }

    async fn disconnect_silent(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }

    async fn disconnect(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = reason {
            let mut packet =
                Packet::plaintext(SystemPacketType::Disconnect.identifier(), reason.into_bytes());
            self.cipher.encrypt_packet(&mut packet);
            if let Ok(bytes) = packet.encode() {
                let mut write_half = self.write_half.lock().await;
                let _ = write_frame(&mut *write_half, bytes).await;
            }
        }
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }
}

async fn run_client_read_loop<R, Ctx>(
    read_half: R,
    connection: Arc<ClientConnection>,
    router: Arc<Router<Ctx>>,
    ctx: Ctx,
    max_packet_size: u32,
    pool: Arc<BufferPool>,
    on_disconnected: impl Fn(),
) where
    R: AsyncRead + Unpin,
    Ctx: Clone,
{
    let mut read_half = read_half;
    loop {
        let frame = match read_frame(&mut read_half, max_packet_size, &pool).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "server connection read failed");
                break;
            }
        };

        let bytes = match frame {
            Frame::KeepAlive => continue,
            Frame::Payload(buf) => buf.as_slice().to_vec(),
        };

        let mut packet = match Packet::decode(&bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "malformed envelope from server");
                break;
            }
        };

        if packet.encrypted() && connection.cipher.decrypt_packet(&mut packet).is_err() {
            debug!("AEAD authentication failed, closing connection");
            break;
        }

        match SystemPacketType::from_identifier(packet.identifier()) {
            Some(SystemPacketType::KeepAlive) => continue,
            Some(SystemPacketType::Disconnect) => {
                connection.disconnect_silent().await;
                break;
            }
            Some(SystemPacketType::Handshake) => continue,
            None if packet.identifier().is_reserved() => continue,
            None => {
                if let Some(future) = router.route(ctx.clone(), packet) {
                    future.await;
                }
            }
        }
    }

    connection.disconnect_silent().await;
    on_disconnected();
}

/// A client holding at most one active session. `connect()` compare-
/// and-sets a flag from unconnected to connected, so a second concurrent
/// `connect()` fails with [`UsageError::AlreadyConnected`] rather than
/// silently replacing the session. The handshake runs before the
/// connection is published, so a failed handshake leaves the client
/// reconnectable.
pub struct Client<Ctx> {
    connected: AtomicBool,
    connection: AsyncMutex<Option<Arc<ClientConnection>>>,
    router: Arc<Router<Ctx>>,
    trust_store: TrustStore,
    config: ClientConfig,
    pool: Arc<BufferPool>,
}

impl<Ctx> Client<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    pub fn new(config: ClientConfig, router: Arc<Router<Ctx>>) -> Result<Arc<Self>, Error> {
        let trust_store = TrustStore::load(&config.trust_store_path)?;
        Ok(Arc::new(Self {
            connected: AtomicBool::new(false),
            connection: AsyncMutex::new(None),
            router,
            trust_store,
            config,
            pool: BufferPool::new(8),
        }))
    }

    /// Connect, handshake, and start the read loop. `ctx` is cloned into
    /// every dispatched handler call; `on_disconnected` fires once, on
    /// any terminal condition.
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        ctx: Ctx,
        on_disconnected: impl Fn() + Send + 'static,
    ) -> Result<(), Error> {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(UsageError::AlreadyConnected.into());
        }

        let connect_result = self.try_connect(host, port).await;
        let mut stream = match connect_result {
            Ok(stream) => stream,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handshake = match run_client_handshake(
            &mut stream,
            host,
            port,
            &self.trust_store,
            self.config.protocol.max_packet_size,
            &self.pool,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (read_half, write_half) = split(stream);
        let connection = Arc::new(ClientConnection {
            write_half: AsyncMutex::new(Box::new(write_half)),
            cipher: handshake.cipher,
            closed: AtomicBool::new(false),
        });

        *self.connection.lock().await = Some(connection.clone());

        let router = self.router.clone();
        let max_packet_size = self.config.protocol.max_packet_size;
        let pool = self.pool.clone();
        let this = self.clone();
        tokio::spawn(async move {
            run_client_read_loop(
                read_half,
                connection,
                router,
                ctx,
                max_packet_size,
                pool,
                move || {
                    this.connected.store(false, Ordering::SeqCst);
                    on_disconnected();
                },
            )
            .await;
        });

        Ok(())
    }

    async fn try_connect(&self, host: &str, port: u16) -> Result<TcpStream, Error> {
        TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Io(e).into())
    }

    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) => connection.send(packet).await,
            None => Err(UsageError::NotConnected.into()),
        }
    }

    pub async fn disconnect(&self, reason: Option<String>) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.disconnect(reason).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServerIdentity;
    use crate::packet::PacketIdentifier;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "tofulink-client-test-{name}-{}.json",
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn second_connect_while_connected_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let identity_path = temp_path("identity");
        let identity = ServerIdentity::load_or_generate(&identity_path).unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let pool = BufferPool::new(4);
            let _ = crate::handshake::run_server_handshake(&mut stream, &identity, 65536, &pool)
                .await;
            // Keep the stream open for the duration of the test.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let trust_path = temp_path("trust");
        let config = ClientConfig {
            trust_store_path: trust_path.clone(),
            ..ClientConfig::default()
        };
        let router: Arc<Router<()>> = Arc::new(Router::new());
        let client = Client::new(config, router).unwrap();

        client
            .connect(&addr.ip().to_string(), addr.port(), (), || {})
            .await
            .unwrap();

        let result = client
            .connect(&addr.ip().to_string(), addr.port(), (), || {})
            .await;
        assert!(matches!(result, Err(Error::Usage(UsageError::AlreadyConnected))));

        client.disconnect(None).await;
        server_task.await.ok();
        std::fs::remove_file(&identity_path).ok();
        std::fs::remove_file(&trust_path).ok();
    }

    #[tokio::test]
    async fn dispatches_received_packets_to_the_router() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let identity_path = temp_path("identity-dispatch");
        let identity = ServerIdentity::load_or_generate(&identity_path).unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let pool = BufferPool::new(4);
            let outcome =
                crate::handshake::run_server_handshake(&mut stream, &identity, 65536, &pool)
                    .await
                    .unwrap();
            let mut packet = Packet::plaintext(
                PacketIdentifier::application(101).unwrap(),
                b"greetings".to_vec(),
            );
            outcome.cipher.encrypt_packet(&mut packet);
            write_frame(&mut stream, packet.encode().unwrap()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let trust_path = temp_path("trust-dispatch");
        let config = ClientConfig {
            trust_store_path: trust_path.clone(),
            ..ClientConfig::default()
        };
        let router: Arc<Router<()>> = Arc::new(Router::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router.register(
            PacketIdentifier::application(101).unwrap(),
            Some(Arc::new(move |_ctx: (), _packet: Packet| {
                let calls = calls2.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            })),
        );
        let client = Client::new(config, router).unwrap();
        client
            .connect(&addr.ip().to_string(), addr.port(), (), || {})
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.disconnect(None).await;
        server_task.await.ok();
        std::fs::remove_file(&identity_path).ok();
        std::fs::remove_file(&trust_path).ok();
    }
}
