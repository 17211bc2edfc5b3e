//! At-rest encryption for stored credentials: AES-256-GCM under a key
//! derived from the operator's passphrase.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;
const KEY_CONTEXT: &[u8] = b"crossposter credential store v1\0";

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            bail!("credential store passphrase must not be empty");
        }
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(passphrase.as_bytes());
        let key = hasher.finalize();
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Invalid credential key: {e}"))?;
        Ok(Self { cipher })
    }

    /// Encrypt under a fresh nonce. Output: base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::thread_rng().gen();
        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| anyhow!("Failed to encrypt credentials: {e}"))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.append(&mut sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(sealed)
            .context("Stored credentials are not valid base64")?;
        if raw.len() < NONCE_SIZE {
            bail!("Stored credentials are too short");
        }
        let (nonce, payload) = raw.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| anyhow!("Failed to decrypt credentials, wrong passphrase?"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let vault = Vault::from_passphrase("correct horse").unwrap();
        let sealed = vault.seal(b"app-password").unwrap();
        assert!(!sealed.contains("app-password"));
        assert_eq!(vault.open(&sealed).unwrap(), b"app-password");
    }

    #[test]
    fn test_nonces_differ() {
        let vault = Vault::from_passphrase("correct horse").unwrap();
        assert_ne!(vault.seal(b"same").unwrap(), vault.seal(b"same").unwrap());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = Vault::from_passphrase("one").unwrap().seal(b"token").unwrap();
        let err = Vault::from_passphrase("two").unwrap().open(&sealed).unwrap_err();
        assert!(err.to_string().contains("decrypt"));
    }

    #[test]
    fn test_tampering_and_garbage_are_rejected() {
        let vault = Vault::from_passphrase("k").unwrap();
        let mut raw = STANDARD.decode(vault.seal(b"token").unwrap()).unwrap();
        raw[NONCE_SIZE] ^= 0xff;
        assert!(vault.open(&STANDARD.encode(raw)).is_err());
        assert!(vault.open("not base64 !!").is_err());
        assert!(vault.open(&STANDARD.encode([1u8, 2, 3])).is_err());
    }

    #[test]
    fn test_empty_passphrase_is_rejected() {
        assert!(Vault::from_passphrase("").is_err());
    }
}
