//! Row payload encryption
//!
//! ChaCha20-Poly1305 keyed with the installation secret. Each row gets a
//! fresh random 96-bit nonce stored next to the ciphertext, and the row's
//! `captured_at` is bound in as associated data so a payload cannot be
//! moved onto another row unnoticed.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::secret::EncryptionSecret;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Seals and opens sample payloads.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    pub fn new(secret: &EncryptionSecret) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes())),
        }
    }

    /// Encrypt `plaintext`, returning `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypt a payload sealed by [`seal`](Self::seal).
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(Error::Crypto(format!(
                "invalid nonce length: expected {}, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("payload authentication failed".to_string()))
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher")
    }
}
