//! Client trust store: Trust-On-First-Use over `known_servers.json`
//! (spec.md §4.E).

use crate::error::IdentityError;
use crate::persist::atomic_write;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KnownServerRecord {
    #[serde(rename = "Host")]
    host: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Fingerprint")]
    fingerprint: String,
}

/// SHA-256 fingerprint of a SPKI-encoded public key, rendered as
/// uppercase colon-separated hex (spec.md §3, §6).
pub fn fingerprint(spki_public_key: &[u8]) -> String {
    let digest = Sha256::digest(spki_public_key);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Persisted `(host, port) -> fingerprint` trust pins. The whole file is
/// re-serialized on every change under one lock (spec.md §4.D/§9 "File
/// persistence race").
pub struct TrustStore {
    path: PathBuf,
    records: Mutex<Vec<KnownServerRecord>>,
}

impl TrustStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read(&path) {
            Ok(data) => {
                serde_json::from_slice(&data).map_err(|e| IdentityError::Format(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(IdentityError::Io(e)),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &[KnownServerRecord]) -> Result<(), IdentityError> {
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    /// Compute `SHA256(public_key)` and compare it against any pinned
    /// record for `(host, port)`. If none exists, record it and return
    /// `true`. A pure function of `(persisted_fingerprint?(host,port),
    /// SHA256(pk))` as required by spec.md §8.
    pub fn verify_or_trust(
        &self,
        host: &str,
        port: u16,
        public_key: &[u8],
    ) -> Result<bool, IdentityError> {
        let actual = fingerprint(public_key);
        let mut records = self.records.lock().unwrap();

        if let Some(existing) = records
            .iter()
            .find(|r| r.host == host && r.port == port)
        {
            return Ok(existing.fingerprint == actual);
        }

        warn!(host, port, fingerprint = %actual, "recording new server fingerprint on first contact");
        records.push(KnownServerRecord {
            host: host.to_string(),
            port,
            fingerprint: actual,
        });
        self.persist(&records)?;
        Ok(true)
    }

    /// The fingerprint currently pinned for `(host, port)`, if any.
    pub fn pinned_fingerprint(&self, host: &str, port: u16) -> Option<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.host == host && r.port == port)
            .map(|r| r.fingerprint.clone())
    }
}
