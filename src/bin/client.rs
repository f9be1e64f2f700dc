//! Reference client binary.
//!
//! Connects to a server, sends lines read from stdin as application
//! packets, and prints whatever comes back.

use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tofulink::{Client, Packet, PacketIdentifier, Router};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tofulink-client", version, about = "tofulink reference client")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "7878")]
    port: u16,

    /// Path to this client's trust store (pinned server fingerprints)
    #[arg(short, long, default_value = "known_servers.json")]
    trust_store: PathBuf,
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

    let config = tofulink::ClientConfig {
        trust_store_path: args.trust_store,
        ..tofulink::ClientConfig::default()
    };

    let router: Arc<Router<()>> = Arc::new(Router::new());
    router.register(
        PacketIdentifier::application(ECHO_IDENTIFIER).unwrap(),
        Some(Arc::new(|_ctx: (), packet: Packet| {
            Box::pin(async move {
                println!("< {}", String::from_utf8_lossy(packet.payload()));
            })
        })),
    );

    let client = match Client::new(config, router) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to initialize client: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = client
        .connect(&args.host, args.port, (), || {
            info!("disconnected from server");
        })
        .await
    {
        eprintln!("connect failed: {e}");
        std::process::exit(1);
    }
    info!(host = %args.host, port = args.port, "connected");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        let packet = Packet::plaintext(
            PacketIdentifier::application(ECHO_IDENTIFIER).unwrap(),
            line.into_bytes(),
        );
        if let Err(e) = client.send(packet).await {
            warn!(error = %e, "send failed");
            break;
        }
    }

    client.disconnect(None).await;
}
