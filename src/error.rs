//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own error enum; [`Error`] composes them for
//! call sites that cross subsystem boundaries (e.g. the connection read
//! loop, which can hit transport, protocol or crypto failures in the same
//! `match`).

use thiserror::Error;

/// Transport-layer failures: connection reset/closed, oversize frame, I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("frame of {len} bytes exceeds max_packet_size of {max}")]
    FrameTooLarge { len: u32, max: u32 },
    #[error("negative-length frame prefix")]
    NegativeLength,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-layer failures: malformed or out-of-order handshake traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected packet identifier {got} during handshake, expected {expected}")]
    UnexpectedHandshakePacket { expected: u32, got: u32 },
    #[error("zero-length mandatory field: {0}")]
    EmptyMandatoryField(&'static str),
    #[error("disconnect received mid-handshake")]
    DisconnectDuringHandshake,
    #[error("envelope codec error: {0}")]
    Codec(String),
    #[error("reserved packet identifier {0} used in application context")]
    ReservedIdentifier(u32),
}

/// Identity-layer failures: TOFU mismatch, bad signature.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("server fingerprint mismatch for {host}:{port}: expected {expected}, got {actual}")]
    FingerprintMismatch {
        host: String,
        port: u16,
        expected: String,
        actual: String,
    },
    #[error("handshake signature verification failed — possible MITM")]
    BadSignature,
    #[error("identity store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity store format error: {0}")]
    Format(String),
}

/// Crypto-layer failures: AEAD authentication, key derivation.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD authentication failure")]
    AuthenticationFailed,
    #[error("key derivation failure: {0}")]
    KeyDerivation(String),
    #[error("malformed ciphertext envelope: {0}")]
    MalformedCiphertext(&'static str),
}

/// Policy-layer failures: rate limiting.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rate limit exceeded")]
    RateLimitExceeded,
}

/// Usage errors: caller misuse that doesn't tear down a working session.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("send attempted with no underlying stream")]
    NoStream,
}

/// Top-level error composing every subsystem.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

pub type Result<T> = std::result::Result<T, Error>;
