//! Server orchestrator: listener, registry, scheduler, broadcasts
//! (spec.md §4.M).

use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::connection::server::{run_read_loop, ServerConnection};
use crate::error::{Error, UsageError};
use crate::handshake::run_server_handshake;
use crate::identity::ServerIdentity;
use crate::packet::Packet;
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::scheduler::{DueAction, KeepAliveScheduler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::split;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

type OnDisconnected = Arc<dyn Fn(Uuid) + Send + Sync>;

struct RegisteredConnection {
    connection: Arc<ServerConnection>,
    read_task: AbortHandle,
    on_disconnected: OnDisconnected,
}

type Registry = std::sync::Mutex<HashMap<Uuid, RegisteredConnection>>;

/// Holds the listener-facing state: connection registry, keep-alive
/// scheduler, and broadcast concurrency gate.
pub struct Server {
    identity: ServerIdentity,
    config: ServerConfig,
    router: Arc<Router<Arc<ServerConnection>>>,
    scheduler: Arc<KeepAliveScheduler>,
    registry: Registry,
    broadcast_gate: Arc<Semaphore>,
    pool: Arc<BufferPool>,
    shutdown_signal: Notify,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        router: Arc<Router<Arc<ServerConnection>>>,
    ) -> Result<Arc<Self>, Error> {
        config.protocol.validate();
        let identity = ServerIdentity::load_or_generate(&config.identity_path)?;
        let scheduler = KeepAliveScheduler::new(
            config.protocol.keepalive_interval,
            config.protocol.keepalive_timeout,
        );
        let broadcast_gate = Arc::new(Semaphore::new(config.broadcast_concurrency));
        Ok(Arc::new(Self {
            identity,
            scheduler,
            registry: std::sync::Mutex::new(HashMap::new()),
            broadcast_gate,
            pool: BufferPool::new(64),
            shutdown_signal: Notify::new(),
            router,
            config,
        }))
    }

    /// Accept connections until [`Server::shutdown`] is called.
    /// `on_client_connected`/`on_client_disconnected` fire once per
    /// connection lifecycle.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        on_client_connected: impl Fn(Uuid) + Send + Sync + 'static,
        on_client_disconnected: impl Fn(Uuid) + Send + Sync + 'static,
    ) {
        let on_client_connected = Arc::new(on_client_connected);
        let on_client_disconnected = Arc::new(on_client_disconnected);

        let keepalive_server = self.clone();
        let scheduler_handle = self.scheduler.clone().spawn_loop(Arc::new(move |client, action| {
            let server = keepalive_server.clone();
            tokio::spawn(async move {
                server.dispatch_keepalive_action(client, action).await;
            });
        }));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            let on_connected = on_client_connected.clone();
                            let on_disconnected = on_client_disconnected.clone();
                            tokio::spawn(async move {
                                server.accept_connection(stream, on_connected, on_disconnected).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown_signal.notified() => break,
            }
        }

        scheduler_handle.abort();
        self.disconnect_all_clients("Server is shutting down.".to_string()).await;
        self.drain_or_force_close().await;
    }

    pub fn shutdown(&self) {
        self.shutdown_signal.notify_one();
    }

    /// Tell every currently-registered client we're going away. Each
    /// disconnect runs on its own task so one slow write can't delay the
    /// others; `drain_or_force_close` is what actually waits for the
    /// registry to empty out.
    async fn disconnect_all_clients(&self, reason: String) {
        let connections: Vec<Arc<ServerConnection>> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.connection.clone())
            .collect();
        let tasks: Vec<_> = connections
            .into_iter()
            .map(|connection| {
                let reason = reason.clone();
                tokio::spawn(async move { connection.disconnect(Some(reason)).await })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn drain_or_force_close(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            if self.registry.lock().unwrap().is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<RegisteredConnection> =
            self.registry.lock().unwrap().drain().map(|(_, v)| v).collect();
        for entry in stragglers {
            entry.read_task.abort();
            entry.connection.disconnect_silent().await;
            (entry.on_disconnected)(entry.connection.id);
        }
    }

    /// Remove a connection from the registry, abort its still-running
    /// read task (the read half may still be blocked even after the
    /// connection is marked closed), and fire the disconnected callback.
    /// Shared by the read loop's own exit path and the keep-alive
    /// scheduler's timeout path, so neither one can leak a registry entry
    /// or a blocked task.
    fn finish_connection(&self, id: Uuid) {
        let entry = self.registry.lock().unwrap().remove(&id);
        if let Some(entry) = entry {
            entry.read_task.abort();
            (entry.on_disconnected)(id);
        }
    }

    async fn dispatch_keepalive_action(&self, client: Uuid, action: DueAction) {
        let connection = self
            .registry
            .lock()
            .unwrap()
            .get(&client)
            .map(|entry| entry.connection.clone());
        let Some(connection) = connection else {
            return;
        };
        match action {
            DueAction::SendKeepAlive => {
                let _ = connection.send_keepalive().await;
            }
            DueAction::Disconnect => {
                connection.disconnect_silent().await;
                self.finish_connection(client);
            }
        }
    }

    async fn accept_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        on_connected: Arc<dyn Fn(Uuid) + Send + Sync>,
        on_disconnected: Arc<dyn Fn(Uuid) + Send + Sync>,
    ) {
        let outcome = match run_server_handshake(
            &mut stream,
            &self.identity,
            self.config.protocol.max_packet_size,
            &self.pool,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "handshake failed");
                return;
            }
        };

        let id = Uuid::new_v4();
        let (read_half, write_half) = split(stream);
        let connection = ServerConnection::new(
            id,
            Box::new(write_half),
            outcome.cipher,
            self.scheduler.clone(),
            RateLimiter::new(&self.config.rate_limit),
        );
        self.scheduler.register(id);

        let router = self.router.clone();
        let protocol = self.config.protocol.clone();
        let pool = self.pool.clone();
        let server = self.clone();
        let conn_for_loop = connection.clone();
        let read_task = tokio::spawn(async move {
            run_read_loop(
                read_half,
                conn_for_loop.clone(),
                router,
                conn_for_loop,
                protocol,
                pool,
                move |disconnected_id| server.finish_connection(disconnected_id),
            )
            .await;
        });

        self.registry.lock().unwrap().insert(
            id,
            RegisteredConnection {
                connection,
                read_task: read_task.abort_handle(),
                on_disconnected,
            },
        );
        on_connected(id);
    }

    pub async fn send_to_client(&self, id: Uuid, packet: Packet) -> Result<(), Error> {
        let connection = self
            .registry
            .lock()
            .unwrap()
            .get(&id)
            .map(|entry| entry.connection.clone());
        match connection {
            Some(connection) => connection.send(packet).await,
            None => Err(UsageError::NotConnected.into()),
        }
    }

    /// Fan out `packet` to every connected client, bounded by the
    /// broadcast concurrency gate. A send failure disconnects only the
    /// client that failed.
    pub async fn send_to_clients(&self, packet: Packet) {
        let connections: Vec<Arc<ServerConnection>> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.connection.clone())
            .collect();

        let mut tasks = Vec::with_capacity(connections.len());
        for connection in connections {
            let packet = packet.clone();
            let gate = self.broadcast_gate.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire_owned().await.expect("gate is never closed");
                if connection.send(packet).await.is_err() {
                    connection.disconnect_silent().await;
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn connected_client_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.identity.public_key_spki()
    }
}
