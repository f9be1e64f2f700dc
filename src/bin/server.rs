//! Reference server binary.
//!
//! Accepts connections, logs connect/disconnect, and echoes any
//! application packet it receives back to the sender.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tofulink::{Packet, PacketIdentifier, Router, Server, ServerConfig, ServerConnection};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tofulink-server", version, about = "tofulink reference server")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value = "7878")]
    port: u16,

    /// Path to the server's identity file (generated on first run)
    #[arg(short, long, default_value = "server_key.json")]
    identity: PathBuf,

    /// Keep-alive ping interval, in seconds
    #[arg(long, default_value = "5")]
    keepalive_interval: u64,

    /// Keep-alive idle timeout, in seconds
    #[arg(long, default_value = "15")]
    keepalive_timeout: u64,
}

const ECHO_IDENTIFIER: u32 = 101;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tofulink=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = ServerConfig {
        identity_path: args.identity,
        ..ServerConfig::default()
    };
    config.protocol.keepalive_interval = Duration::from_secs(args.keepalive_interval);
    config.protocol.keepalive_timeout = Duration::from_secs(args.keepalive_timeout);

    let router: Arc<Router<Arc<ServerConnection>>> = Arc::new(Router::new());
    router.register(
        PacketIdentifier::application(ECHO_IDENTIFIER).unwrap(),
        Some(Arc::new(move |connection: Arc<ServerConnection>, packet: Packet| {
            Box::pin(async move {
                let reply = Packet::plaintext(packet.identifier(), packet.into_payload());
                if let Err(e) = connection.send(reply).await {
                    warn!(client = %connection.id, error = %e, "echo reply failed");
                }
            })
        })),
    );

    let server = match Server::new(config, router) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start server: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind port {}: {e}", args.port);
            std::process::exit(1);
        }
    };
    info!(port = args.port, "listening");

    let running = server.clone();
    tokio::spawn(async move {
        running
            .run(
                listener,
                |id| info!(client = %id, "client connected"),
                |id| info!(client = %id, "client disconnected"),
            )
            .await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    server.shutdown();
}
