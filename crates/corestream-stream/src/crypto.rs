//! AES-256-GCM payload encryption.
//!
//! Ciphertext layout on disk is `nonce (12 bytes) || ciphertext`; the nonce
//! is generated fresh per encryption and needs no separate storage.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit};
use corestream_types::{Error, Result};

const NONCE_LEN: usize = 12;

/// A raw 256-bit AES-GCM key.
#[derive(Clone, Copy)]
pub struct AesGcmKey(pub [u8; 32]);

impl std::fmt::Debug for AesGcmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmKey").field("0", &"[redacted]").finish()
    }
}

pub(crate) fn encrypt(key: &AesGcmKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let mut out = nonce.to_vec();
    out.append(&mut ciphertext);
    Ok(out)
}

pub(crate) fn decrypt(key: &AesGcmKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Crypto("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    cipher
        .decrypt(nonce_bytes.into(), ciphertext)
        .map_err(|e| Error::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = AesGcmKey([3u8; 32]);
        let ciphertext = encrypt(&key, b"hello world").unwrap();
        let plaintext = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let ciphertext = encrypt(&AesGcmKey([1u8; 32]), b"secret").unwrap();
        assert!(decrypt(&AesGcmKey([2u8; 32]), &ciphertext).is_err());
    }
}
