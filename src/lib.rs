pub mod aead;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod kex;
pub mod packet;
pub mod persist;
pub mod rate_limit;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod trust;

pub use buffer_pool::BufferPool;
pub use config::{ClientConfig, ProtocolConfig, RateLimitConfig, ServerConfig};
pub use connection::client::Client;
pub use connection::server::ServerConnection;
pub use error::{CryptoError, Error, IdentityError, ProtocolError, TransportError, UsageError};
pub use identity::ServerIdentity;
pub use packet::{Packet, PacketIdentifier, SystemPacketType};
pub use router::Router;
pub use server::Server;
pub use trust::TrustStore;
