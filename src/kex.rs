//! Ephemeral P-256 ECDH key agreement (spec.md §4.F).
//!
//! Each handshake generates a fresh ephemeral key pair; the resulting
//! shared secret is hashed to the 256-bit AES key used for the session
//! (spec.md §4.G).

use crate::error::CryptoError;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// A one-time key pair used for a single handshake. Never persisted;
/// dropped (and zeroized by `p256`) once the session key is derived.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Uncompressed SEC1 point, the form exchanged on the wire
    /// (spec.md §4.H messages 1 and 2).
    pub fn public_point(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Run ECDH against the peer's ephemeral public key and derive the
    /// 256-bit session key as `SHA256(shared_secret)`.
    pub fn derive_session_key(self, peer_public: &PublicKey) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(peer_public);
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }
}

/// Parse a peer's ephemeral public key from its wire encoding
/// (an uncompressed or compressed SEC1 point).
pub fn decode_public_point(encoded_point: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(encoded_point)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
