//! Per-accepted-stream connection state (spec.md §4.K).

use crate::aead::SessionCipher;
use crate::config::ProtocolConfig;
use crate::error::Error;
use crate::framing::{read_frame, write_frame, write_keepalive, Frame};
use crate::packet::{Packet, SystemPacketType};
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::scheduler::KeepAliveScheduler;
use crate::buffer_pool::BufferPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connected client's send-side handle. Cheap to clone (wraps an
/// `Arc`); shared between the read loop, the router's handlers, and the
/// server's broadcast path.
pub struct ServerConnection {
    pub id: Uuid,
    write_half: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    cipher: SessionCipher,
    closed: AtomicBool,
    scheduler: Arc<KeepAliveScheduler>,
    rate_limiter: std::sync::Mutex<RateLimiter>,
}

impl ServerConnection {
    pub fn new(
        id: Uuid,
        write_half: Box<dyn AsyncWrite + Unpin + Send>,
        cipher: SessionCipher,
        scheduler: Arc<KeepAliveScheduler>,
        rate_limiter: RateLimiter,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            write_half: AsyncMutex::new(write_half),
            cipher,
            closed: AtomicBool::new(false),
            scheduler,
            rate_limiter: std::sync::Mutex::new(rate_limiter),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encrypt and send one application or system packet.
    pub async fn send(&self, mut packet: Packet) -> Result<(), Error> {
        self.cipher.encrypt_packet(&mut packet);
        let bytes = packet.encode()?;
        let mut write_half = self.write_half.lock().await;
        write_frame(&mut *write_half, bytes).await?;
        drop(write_half);
        self.scheduler.update_last_sent(self.id);
        Ok(())
    }

    /// Send a bare keep-alive frame and mark liveness.
    pub async fn send_keepalive(&self) -> Result<(), Error> {
        let mut write_half = self.write_half.lock().await;
        write_keepalive(&mut *write_half).await?;
        drop(write_half);
        self.scheduler.update_last_sent(self.id);
        Ok(())
    }

    async fn shutdown_stream(&self) {
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }

    /// Best-effort `Disconnect` with a reason, then silent teardown.
    /// Idempotent: only the first caller does anything.
    pub async fn disconnect(&self, reason: Option<String>) {
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
        self.scheduler.unregister(self.id);
        self.shutdown_stream().await;
    }

    /// Teardown without attempting to notify the peer, for when the
    /// peer is already known unreachable.
    pub async fn disconnect_silent(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.unregister(self.id);
        self.shutdown_stream().await;
    }
}

/// Drive the per-connection read loop until a terminal condition is
/// reached, then fire `on_disconnected`. `router` dispatches application
/// packets; system packets are handled inline.
pub async fn run_read_loop<R, Ctx>(
    read_half: R,
    connection: Arc<ServerConnection>,
    router: Arc<Router<Ctx>>,
    ctx: Ctx,
    protocol: ProtocolConfig,
    pool: Arc<BufferPool>,
    on_disconnected: impl Fn(Uuid),
) where
    R: AsyncRead + Unpin,
    Ctx: Clone,
{
    let mut read_half = read_half;
    loop {
        let frame = match read_frame(&mut read_half, protocol.max_packet_size, &pool).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %connection.id, error = %e, "connection read failed");
                break;
            }
        };

        let bytes = match frame {
            Frame::KeepAlive => {
                connection.scheduler.update_last_received(connection.id);
                continue;
            }
            Frame::Payload(buf) => buf.as_slice().to_vec(),
        };

        let mut packet = match Packet::decode(&bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(client = %connection.id, error = %e, "malformed envelope");
                break;
            }
        };
        connection.scheduler.update_last_received(connection.id);

        if packet.encrypted() {
            if connection.cipher.decrypt_packet(&mut packet).is_err() {
                warn!(client = %connection.id, "AEAD authentication failed, closing connection");
                break;
            }
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
                let allowed = {
                    let mut limiter = connection.rate_limiter.lock().unwrap();
                    limiter.try_consume(packet.identifier(), packet.payload().len())
                };
                if !allowed {
                    connection
                        .disconnect(Some("Rate limit exceeded.".to_string()))
                        .await;
                    break;
                }
                if let Some(future) = router.route(ctx.clone(), packet) {
                    future.await;
                }
            }
        }
    }

    connection.disconnect_silent().await;
    on_disconnected(connection.id);
}
