//! Process-wide defaults threaded as configuration structs instead of
//! global state (spec.md §9 Design Note: "Global state").

use std::time::Duration;

/// Default maximum serialized envelope size: 64 KiB.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Keep-alive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Keep-alive idle timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bounded concurrency for `send_to_clients` broadcasts.
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 100;

/// Default rate limiter: sustained/burst packets and bytes per second.
pub const DEFAULT_PACKETS_PER_SECOND: f64 = 20.0;
pub const DEFAULT_PACKETS_BURST: f64 = 40.0;
pub const DEFAULT_BYTES_PER_SECOND: f64 = 1000.0;
pub const DEFAULT_BYTES_BURST: f64 = 2000.0;

/// Server-side shutdown grace period before forcibly closing laggards.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Configuration shared by both server and client connection state
/// machines: the framing limit and the keep-alive timing pair.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub max_packet_size: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl ProtocolConfig {
    /// Panics if `keepalive_interval >= keepalive_timeout`, which would
    /// violate the scheduler's core invariant (spec.md §4.I).
    pub fn validate(&self) {
        assert!(
            self.keepalive_interval < self.keepalive_timeout,
            "keepalive_interval must be < keepalive_timeout"
        );
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

/// Rate limiter defaults, independent of a specific connection.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub packets_per_second: f64,
    pub packets_burst: f64,
    pub bytes_per_second: f64,
    pub bytes_burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            packets_per_second: DEFAULT_PACKETS_PER_SECOND,
            packets_burst: DEFAULT_PACKETS_BURST,
            bytes_per_second: DEFAULT_BYTES_PER_SECOND,
            bytes_burst: DEFAULT_BYTES_BURST,
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol: ProtocolConfig,
    pub rate_limit: RateLimitConfig,
    pub broadcast_concurrency: usize,
    pub shutdown_grace: Duration,
    pub identity_path: std::path::PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            identity_path: std::path::PathBuf::from("server_key.json"),
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: ProtocolConfig,
    pub trust_store_path: std::path::PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            trust_store_path: std::path::PathBuf::from("known_servers.json"),
        }
    }
}
