//! Integration credential encryption
//!
//! Credentials for third-party destinations are stored only as AES-256-GCM
//! ciphertext. The symmetric key is derived with HKDF-SHA256 from a
//! server-held master secret and a per-user random salt, so a leaked
//! database row is useless without the master secret, and a leaked master
//! secret alone still requires the per-row salt.
//!
//! Blob layout: `nonce (12 bytes) || ciphertext`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Length of the random per-user salt
pub const SALT_LEN: usize = 16;

/// Length of the AES-GCM nonce prefixed to each blob
const NONCE_LEN: usize = 12;

/// Errors from credential encryption and decryption
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext too short or tampered with
    #[error("Credential blob is malformed")]
    Malformed,
    /// Authentication failed during decryption
    #[error("Credential decryption failed")]
    DecryptFailed,
}

/// Encrypts and decrypts integration credential blobs
pub struct CredentialCipher {
    master_secret: Vec<u8>,
}

impl CredentialCipher {
    /// Creates a cipher over the server master secret
    pub fn new(master_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    /// Generates a fresh random per-user salt
    pub fn generate_salt() -> Vec<u8> {
        use rand::RngCore;
        let mut salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }

    fn derive_key(&self, salt: &[u8]) -> Key<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master_secret);
        let mut key = [0u8; 32];
        hk.expand(b"inkmirror integration credentials", &mut key)
            .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
        key.into()
    }

    /// Encrypts plaintext credentials under the key derived for `salt`
    pub fn encrypt(&self, salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(&self.derive_key(salt));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Malformed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a nonce-prefixed blob under the key derived for `salt`
    pub fn decrypt(&self, salt: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.derive_key(salt));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = CredentialCipher::new("master-secret");
        let salt = CredentialCipher::generate_salt();
        let blob = cipher.encrypt(&salt, b"{\"api_key\":\"secret\"}").unwrap();
        let plain = cipher.decrypt(&salt, &blob).unwrap();
        assert_eq!(plain, b"{\"api_key\":\"secret\"}");
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let cipher = CredentialCipher::new("master-secret");
        let salt = CredentialCipher::generate_salt();
        let blob = cipher.encrypt(&salt, b"plaintext").unwrap();
        assert!(!blob.windows(9).any(|w| w == b"plaintext"));
    }

    #[test]
    fn test_wrong_salt_fails() {
        let cipher = CredentialCipher::new("master-secret");
        let salt_a = CredentialCipher::generate_salt();
        let salt_b = CredentialCipher::generate_salt();
        let blob = cipher.encrypt(&salt_a, b"creds").unwrap();
        assert!(matches!(
            cipher.decrypt(&salt_b, &blob),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn test_wrong_master_fails() {
        let salt = CredentialCipher::generate_salt();
        let blob = CredentialCipher::new("master-a")
            .encrypt(&salt, b"creds")
            .unwrap();
        assert!(CredentialCipher::new("master-b").decrypt(&salt, &blob).is_err());
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = CredentialCipher::new("master-secret");
        let salt = CredentialCipher::generate_salt();
        let mut blob = cipher.encrypt(&salt, b"creds").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(cipher.decrypt(&salt, &blob).is_err());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let cipher = CredentialCipher::new("master-secret");
        assert!(matches!(
            cipher.decrypt(&[0u8; SALT_LEN], &[1, 2, 3]),
            Err(CryptoError::Malformed)
        ));
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = CredentialCipher::new("master-secret");
        let salt = CredentialCipher::generate_salt();
        let a = cipher.encrypt(&salt, b"same").unwrap();
        let b = cipher.encrypt(&salt, b"same").unwrap();
        assert_ne!(a, b);
    }
}
