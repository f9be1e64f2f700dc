//! Packet envelope and identifier model (spec.md §3, §4.B).

use crate::error::ProtocolError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::OnceLock;

/// Identifiers `0..=100` are reserved for system packets.
pub const RESERVED_RANGE_END: u32 = 100;

/// Wrapper over a `u32` packet identifier. Construction from application
/// code rejects values in the reserved range `0..=100` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketIdentifier(u32);

impl PacketIdentifier {
    /// Construct an application identifier; rejects the reserved range.
    pub fn application(id: u32) -> Result<Self, ProtocolError> {
        if id <= RESERVED_RANGE_END {
            return Err(ProtocolError::ReservedIdentifier(id));
        }
        Ok(Self(id))
    }

    /// Construct a system identifier in `1..=100`. Used internally by
    /// [`SystemPacketType`] and by tests; not exposed to application code
    /// as an infallible constructor.
    pub fn system(id: u32) -> Result<Self, ProtocolError> {
        if id == 0 || id > RESERVED_RANGE_END {
            return Err(ProtocolError::ReservedIdentifier(id));
        }
        Ok(Self(id))
    }

    /// Construct from a raw wire value without range validation — used
    /// only when decoding an envelope off the wire, where the peer may
    /// legitimately send any system identifier the router recognizes.
    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_reserved(self) -> bool {
        self.0 <= RESERVED_RANGE_END
    }
}

impl std::fmt::Display for PacketIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference assignment of system packet identifiers (spec.md §3).
/// Implementers may assign other values in `[1, 100]` by agreement; these
/// are the ones this crate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPacketType {
    Handshake = 1,
    Disconnect = 2,
    KeepAlive = 3,
}

impl SystemPacketType {
    pub fn identifier(self) -> PacketIdentifier {
        PacketIdentifier(self as u32)
    }

    pub fn from_identifier(id: PacketIdentifier) -> Option<Self> {
        match id.0 {
            1 => Some(Self::Handshake),
            2 => Some(Self::Disconnect),
            3 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// The wire envelope: `(identifier, encrypted, payload)`.
///
/// The serialized form is cached lazily and invalidated whenever the
/// payload is replaced (e.g. by encryption) — a broadcast of an
/// already-encoded packet never re-serializes (spec.md §4.B).
#[derive(Debug, Clone)]
pub struct Packet {
    identifier: PacketIdentifier,
    encrypted: bool,
    payload: Vec<u8>,
    cached: OnceLock<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    identifier: u32,
    encrypted: bool,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(identifier: PacketIdentifier, encrypted: bool, payload: Vec<u8>) -> Self {
        Self {
            identifier,
            encrypted,
            payload,
            cached: OnceLock::new(),
        }
    }

    pub fn plaintext(identifier: PacketIdentifier, payload: Vec<u8>) -> Self {
        Self::new(identifier, false, payload)
    }

    pub fn identifier(&self) -> PacketIdentifier {
        self.identifier
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Replace the payload and encrypted flag, invalidating any cached
    /// serialized form. Used by the AEAD layer on encrypt/decrypt.
    pub fn replace_payload(&mut self, payload: Vec<u8>, encrypted: bool) {
        self.payload = payload;
        self.encrypted = encrypted;
        self.cached = OnceLock::new();
    }

    /// Deterministically serialize `(identifier, encrypted, payload)`,
    /// caching the result for resend without re-encoding.
    pub fn encode(&self) -> Result<&[u8], ProtocolError> {
        if let Some(bytes) = self.cached.get() {
            return Ok(bytes);
        }
        let wire = WireEnvelope {
            identifier: self.identifier.0,
            encrypted: self.encrypted,
            payload: self.payload.clone(),
        };
        let bytes = bincode::serialize(&wire).map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(self.cached.get_or_init(|| bytes))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope =
            bincode::deserialize(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(Self {
            identifier: PacketIdentifier::from_raw(wire.identifier),
            encrypted: wire.encrypted,
            payload: wire.payload,
            cached: OnceLock::new(),
        })
    }

    /// A lazily-decoded typed view over the payload. Decoding does not
    /// consume or re-parse the original byte payload on repeated calls
    /// (spec.md §9 "Typed packet view").
    pub fn view<T: DeserializeOwned>(&self) -> As<'_, T> {
        As {
            packet: self,
            decoded: OnceLock::new(),
        }
    }
}

/// View of a [`Packet`]'s payload decoded as `T`. Not a conversion: the
/// underlying packet is untouched and can still be resent or re-encoded.
pub struct As<'p, T> {
    packet: &'p Packet,
    decoded: OnceLock<T>,
}

impl<'p, T: DeserializeOwned> As<'p, T> {
    pub fn get(&self) -> Result<&T, ProtocolError> {
        if let Some(v) = self.decoded.get() {
            return Ok(v);
        }
        let v: T = bincode::deserialize(self.packet.payload())
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(self.decoded.get_or_init(|| v))
    }
}
