//! API-key encryption at rest
//!
//! Keys are encrypted with ChaCha20-Poly1305 under a single process-wide key
//! supplied via configuration. Each encryption draws a fresh random 12-byte
//! nonce, prepended to the ciphertext; the stored form is
//! `v1:<hex(nonce ‖ ciphertext ‖ tag)>`. Decrypted plaintext is returned in a
//! [`Zeroizing`] wrapper so it is wiped when the call frame drops it.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use crate::PersistError;

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Ciphertext prefix identifying the current format.
const PREFIX: &str = "v1:";

/// Process-wide cipher for API keys. Read-only after construction.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: ChaCha20Poly1305,
}

impl KeyCipher {
    /// Build from the 32-byte key configured via `encryption_key`.
    pub fn new(key_bytes: [u8; 32]) -> Self {
        let key = Key::from_slice(&key_bytes);
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    /// Encrypt a plaintext API key for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PersistError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| PersistError::Crypto("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", PREFIX, hex::encode(blob)))
    }

    /// Decrypt a stored API key. The plaintext is zeroized on drop.
    pub fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>, PersistError> {
        let hex_str = stored
            .strip_prefix(PREFIX)
            .ok_or_else(|| PersistError::Crypto("unknown ciphertext format".into()))?;
        let blob = hex::decode(hex_str)
            .map_err(|_| PersistError::Crypto("corrupt ciphertext hex".into()))?;
        if blob.len() <= NONCE_LEN {
            return Err(PersistError::Crypto("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PersistError::Crypto("wrong key or tampered ciphertext".into()))?;

        String::from_utf8(plaintext_bytes)
            .map(Zeroizing::new)
            .map_err(|_| PersistError::Crypto("decrypted key is not UTF-8".into()))
    }

    /// Masked preview of a stored key, for client DTOs. Undecryptable values
    /// degrade to a bare mask rather than erroring a listing.
    pub fn preview(&self, stored: &str) -> String {
        match self.decrypt(stored) {
            Ok(plaintext) => parley_core::ApiProfile::key_preview(&plaintext),
            Err(_) => "****".to_string(),
        }
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material, even in debug output.
        f.write_str("KeyCipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KeyCipher {
        KeyCipher::new([7u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let stored = c.encrypt("sk-secret-1234").unwrap();
        assert!(stored.starts_with("v1:"));
        assert!(!stored.contains("secret"));
        let plain = c.decrypt(&stored).unwrap();
        assert_eq!(plain.as_str(), "sk-secret-1234");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let c = cipher();
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = cipher().encrypt("sk-abc").unwrap();
        let other = KeyCipher::new([9u8; 32]);
        assert!(other.decrypt(&stored).is_err());
    }

    #[test]
    fn test_tamper_detected() {
        let c = cipher();
        let mut stored = c.encrypt("sk-abc").unwrap();
        let flipped = if stored.ends_with('0') { '1' } else { '0' };
        stored.pop();
        stored.push(flipped);
        assert!(c.decrypt(&stored).is_err());
    }

    #[test]
    fn test_preview_masks() {
        let c = cipher();
        let stored = c.encrypt("sk-abcdef123456").unwrap();
        assert_eq!(c.preview(&stored), "****3456");
    }
}
