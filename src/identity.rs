//! Server identity store (spec.md §4.D).
//!
//! Persists a long-term ECDSA-P256 signing key pair to `server_key.json`,
//! generating one on first run. Mirrors the teacher's
//! `BanList::load`/`save` pattern (`src/net/connection.rs`) but over
//! `serde_json` instead of `bincode`, since the spec calls for an
//! operator-legible file.

use crate::error::IdentityError;
use crate::persist::atomic_write;
use base64::Engine;
use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::elliptic_curve::sec1::{DecodeEcPrivateKey, EncodeEcPrivateKey, ToEncodedPoint};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    #[serde(rename = "PrivateKey")]
    private_key: String,
    #[serde(rename = "PublicKey")]
    public_key: String,
}

/// Long-term server signing identity. Generated once, reused thereafter.
pub struct ServerIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    path: PathBuf,
}

impl ServerIdentity {
    /// Load the key pair from `path`, or generate and persist a new one
    /// if the file is absent or malformed.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        match Self::load(&path) {
            Ok(identity) => Ok(identity),
            Err(_) => {
                info!(path = %path.display(), "generating new server identity");
                let identity = Self::generate(path.clone());
                identity.persist()?;
                Ok(identity)
            }
        }
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path)?;
        let persisted: PersistedIdentity =
            serde_json::from_slice(&data).map_err(|e| IdentityError::Format(e.to_string()))?;

        let private_bytes = base64::engine::general_purpose::STANDARD
            .decode(&persisted.private_key)
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        let signing_key = SigningKey::from_sec1_der(&private_bytes)
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        let verifying_key = *signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
            path: path.to_path_buf(),
        })
    }

    fn generate(path: PathBuf) -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            path,
        }
    }

    fn persist(&self) -> Result<(), IdentityError> {
        let private_der = self
            .signing_key
            .to_sec1_der()
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        let public_der = self
            .verifying_key
            .to_public_key_der()
            .map_err(|e| IdentityError::Format(e.to_string()))?;

        let persisted = PersistedIdentity {
            private_key: base64::engine::general_purpose::STANDARD.encode(private_der.as_bytes()),
            public_key: base64::engine::general_purpose::STANDARD.encode(public_der.as_bytes()),
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    /// SubjectPublicKeyInfo-encoded public key, sent as the first
    /// handshake message (spec.md §4.H step 1).
    pub fn public_key_spki(&self) -> Vec<u8> {
        self.verifying_key
            .to_public_key_der()
            .expect("verifying key always encodes")
            .as_bytes()
            .to_vec()
    }

    /// ECDSA-SHA256 signature over `message`, DER-encoded.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

/// Verify a DER ECDSA-SHA256 signature against a SPKI-encoded public key
/// (spec.md §4.H step 5).
pub fn verify_signature(spki_public_key: &[u8], message: &[u8], der_signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_der(spki_public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(der_signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

/// Parse a peer's SPKI-encoded P-256 public key into the ECDH-capable
/// form used by [`crate::kex`]. Re-exported here since both the
/// handshake and the trust store need to go from SPKI bytes to a usable
/// public key and this keeps the point-decoding logic in one place.
pub fn public_key_from_spki(spki: &[u8]) -> Result<p256::PublicKey, IdentityError> {
    p256::PublicKey::from_public_key_der(spki).map_err(|e| IdentityError::Format(e.to_string()))
}

/// Re-derive the encoded point bytes for an already-parsed public key,
/// useful when a caller needs to hash/compare it without round-tripping
/// through SPKI again.
pub fn public_key_encoded_point(public_key: &p256::PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(false).as_bytes().to_vec()
}
