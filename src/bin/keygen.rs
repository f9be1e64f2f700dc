//! Server identity key generation tool.
//!
//! Generates a long-term ECDSA-P256 signing identity and writes it to the
//! path the server loads at startup. Running it again against an existing
//! path just reloads and re-prints the existing identity unless `--force`
//! is given.
//!
//! Usage:
//!   cargo run --bin keygen -- --output ./server_key.json

use base64::Engine;
use clap::Parser;
use std::path::PathBuf;
use tofulink::ServerIdentity;

#[derive(Parser)]
#[command(name = "keygen", version, about = "tofulink server identity generator")]
struct Args {
    /// Output path for the identity file
    #[arg(short, long, default_value = "server_key.json")]
    output: PathBuf,

    /// Overwrite an existing identity file instead of reusing it
    #[arg(long)]
    force: bool,
}

fn main() {
    let args = Args::parse();

    if args.force {
        std::fs::remove_file(&args.output).ok();
    }

    match ServerIdentity::load_or_generate(&args.output) {
        Ok(identity) => {
            println!("identity written to {}", args.output.display());
            println!(
                "public key (SPKI, base64): {}",
                base64::engine::general_purpose::STANDARD.encode(identity.public_key_spki())
            );
        }
        Err(e) => {
            eprintln!("failed to generate identity: {e}");
            std::process::exit(1);
        }
    }
}
