// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Credential encryption for settings at rest.
//!
//! AES-256-GCM with a random 96-bit nonce prefixed to the ciphertext; the
//! whole value is stored as opaque bytes (BYTEA). The master key is 32 bytes,
//! supplied hex-encoded through configuration. There is deliberately no
//! plaintext passthrough: a missing or malformed key is a startup error, and
//! decrypted passwords exist only as transients around a single IMAP/SMTP
//! operation.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid encryption key: must be 32 bytes (64 hex characters)")]
    InvalidKeyLength,
    #[error("invalid hex in encryption key: {0}")]
    InvalidKeyHex(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid encrypted data: {0}")]
    InvalidFormat(String),
}

/// Symmetric encryptor for stored mail credentials.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build from a 64-hex-character master key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CryptoError> {
        if key_hex.len() != 64 {
            return Err(CryptoError::InvalidKeyLength);
        }
        let key_bytes = hex::decode(key_hex).map_err(|e| CryptoError::InvalidKeyHex(e.to_string()))?;
        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext credential into `nonce || ciphertext` bytes.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext` bytes back into the plaintext credential.
    pub fn decrypt(&self, data: &[u8]) -> Result<String, CryptoError> {
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(format!("utf8: {}", e)))
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();

        let plaintext = "my-secret-password";
        let encrypted = cipher.encrypt(plaintext).unwrap();

        assert_ne!(encrypted.as_slice(), plaintext.as_bytes());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn unique_ciphertexts_for_same_plaintext() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();

        let a = cipher.encrypt("same-password").unwrap();
        let b = cipher.encrypt("same-password").unwrap();
        assert_ne!(a, b);

        assert_eq!(cipher.decrypt(&a).unwrap(), "same-password");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same-password");
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(
            CredentialCipher::from_hex_key("tooshort"),
            Err(CryptoError::InvalidKeyLength)
        ));
    }

    #[test]
    fn rejects_non_hex_key() {
        let bad = "zz".repeat(32);
        assert!(matches!(
            CredentialCipher::from_hex_key(&bad),
            Err(CryptoError::InvalidKeyHex(_))
        ));
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; 8]),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();
        let mut encrypted = cipher.encrypt("password").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;
        assert!(matches!(
            cipher.decrypt(&encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn debug_output_is_opaque() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();
        let rendered = format!("{:?}", cipher);
        assert!(!rendered.contains(TEST_KEY));
    }
}
