//! Credential vault -- AES-256-GCM over a key derived once per process.
//!
//! The master secret comes from configuration at startup; the working key is
//! derived from it a single time (HKDF-SHA256) and reused for the process
//! lifetime. Stored blobs are base64(nonce || ciphertext || tag).

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

const HKDF_INFO: &[u8] = b"reportrunner-vault-v1";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key too short (need at least 16 bytes of entropy)")]
    InvalidMasterKey,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("credential blob is malformed: {0}")]
    Malformed(String),
}

/// Decrypted credentials for one pipeline run.
///
/// Owned exclusively by the run that decrypted them; the secret fields are
/// zeroed when the value is dropped.
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub pin: Option<String>,
    pub scope_selector: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("pin", &self.pin.as_ref().map(|_| "[REDACTED]"))
            .field("scope_selector", &self.scope_selector)
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
        if let Some(pin) = self.pin.as_mut() {
            pin.zeroize();
        }
    }
}

/// Process-wide vault holding the derived cipher.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Derive the working key from the master secret. Done once at startup.
    pub fn new(master_secret: &str) -> Result<Self, VaultError> {
        if master_secret.len() < 16 {
            return Err(VaultError::InvalidMasterKey);
        }

        let hk = Hkdf::<Sha256>::new(None, master_secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| VaultError::InvalidMasterKey)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VaultError::Encrypt(format!("cipher init: {e}")))?;
        key.zeroize();

        Ok(Self { cipher })
    }

    /// Encrypt a plaintext secret into an opaque blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Decrypt an opaque blob back into the plaintext secret.
    ///
    /// A failure here is scoped to the one tenant whose blob this is; callers
    /// must not let it abort processing of other tenants.
    pub fn decrypt(&self, blob: &str) -> Result<String, VaultError> {
        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|e| VaultError::Malformed(e.to_string()))?;

        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::Malformed("blob too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Decrypt("key mismatch or tampered blob".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Decrypt(e.to_string()))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("cipher", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::new("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_roundtrip_ascii() {
        let vault = test_vault();
        let blob = vault.encrypt("s3cret-password").unwrap();
        assert_eq!(vault.decrypt(&blob).unwrap(), "s3cret-password");
    }

    #[test]
    fn test_roundtrip_empty() {
        let vault = test_vault();
        let blob = vault.encrypt("").unwrap();
        assert_eq!(vault.decrypt(&blob).unwrap(), "");
    }

    #[test]
    fn test_roundtrip_multibyte() {
        let vault = test_vault();
        let blob = vault.encrypt("pàsswörd-émile-日本").unwrap();
        assert_eq!(vault.decrypt(&blob).unwrap(), "pàsswörd-émile-日本");
    }

    #[test]
    fn test_same_plaintext_different_blobs() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        // Random nonce per blob
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = test_vault();
        let b = Vault::new("another-master-secret-entirely!!").unwrap();
        let blob = a.encrypt("secret").unwrap();
        assert!(matches!(b.decrypt(&blob), Err(VaultError::Decrypt(_))));
    }

    #[test]
    fn test_malformed_blob_fails() {
        let vault = test_vault();
        assert!(matches!(
            vault.decrypt("not base64 at all!!"),
            Err(VaultError::Malformed(_))
        ));
        assert!(matches!(
            vault.decrypt("c2hvcnQ"),
            Err(VaultError::Malformed(_))
        ));
    }

    #[test]
    fn test_master_key_too_short() {
        assert!(matches!(
            Vault::new("tooshort"),
            Err(VaultError::InvalidMasterKey)
        ));
    }
}
