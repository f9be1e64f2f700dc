//! Per-session AES-256-GCM packet encryption (spec.md §4.G).
//!
//! Wire layout of an encrypted payload is `nonce(12) || ciphertext+tag`.
//! A fresh random nonce is drawn for every encrypt call; GCM's 96-bit
//! nonce space is never reused under a given session key because each
//! session key itself is single-use (spec.md §4.F).

use crate::error::CryptoError;
use crate::packet::Packet;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;

/// Bound to one session's 256-bit key, derived once per handshake.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(key).expect("32-byte key is always valid"),
        }
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("encryption with a fixed-size key/nonce cannot fail");

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt `nonce || ciphertext+tag`, failing closed on either a
    /// malformed envelope or an authentication failure.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::MalformedCiphertext("shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Encrypt a packet's payload in place, marking it encrypted and
    /// invalidating its cached wire encoding.
    pub fn encrypt_packet(&self, packet: &mut Packet) {
        let ciphertext = self.encrypt(packet.payload());
        packet.replace_payload(ciphertext, true);
    }

    /// Decrypt a packet's payload in place, marking it plaintext.
    pub fn decrypt_packet(&self, packet: &mut Packet) -> Result<(), CryptoError> {
        let plaintext = self.decrypt(packet.payload())?;
        packet.replace_payload(plaintext, false);
        Ok(())
    }
}
