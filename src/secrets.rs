//! Secret material handling
//!
//! Access-token keys are stored as keyed SHA-256 hashes (the master secret is
//! the salt, so lookups stay O(1) by hash). Device-flow credential bundles
//! are encrypted at rest with AES-256-GCM under a key derived from the local
//! master secret. The master secret lives in a file next to the database and
//! is created on first start.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

const PBKDF2_ROUNDS: u32 = 4096;
const BUNDLE_CONTEXT: &[u8] = b"llm-gateway/credential-bundle/v1";

pub struct SecretStore {
    master: [u8; 32],
}

impl SecretStore {
    /// Load the master secret, creating it on first use.
    pub fn load_or_create(path: Option<&Path>) -> AppResult<Self> {
        let p = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
                p.push("llm-gateway");
                std::fs::create_dir_all(&p)?;
                p.push("secret.key");
                p
            }
        };

        if p.exists() {
            let raw = std::fs::read_to_string(&p)?;
            let bytes = hex::decode(raw.trim())
                .map_err(|e| AppError::Secret(format!("malformed master secret: {}", e)))?;
            if bytes.len() != 32 {
                return Err(AppError::Secret("master secret must be 32 bytes".to_string()));
            }
            let mut master = [0u8; 32];
            master.copy_from_slice(&bytes);
            return Ok(Self { master });
        }

        let mut master = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut master);
        std::fs::write(&p, hex::encode(master))?;
        Ok(Self { master })
    }

    pub fn from_bytes(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// Deterministic keyed hash of an access-token key.
    pub fn key_hash(&self, key: &str) -> String {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.master).expect("hmac accepts any key length");
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn bundle_key(&self) -> Key<Aes256Gcm> {
        let mut derived = [0u8; 32];
        pbkdf2_hmac::<Sha256>(&self.master, BUNDLE_CONTEXT, PBKDF2_ROUNDS, &mut derived);
        *Key::<Aes256Gcm>::from_slice(&derived)
    }

    /// Encrypt a credential bundle for storage. Output is hex(nonce || ct).
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let cipher = Aes256Gcm::new(&self.bundle_key());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Secret("bundle encryption failed".to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, blob: &str) -> AppResult<String> {
        let raw = hex::decode(blob.trim())
            .map_err(|e| AppError::Secret(format!("malformed bundle: {}", e)))?;
        if raw.len() < 12 {
            return Err(AppError::Secret("bundle too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(12);
        let cipher = Aes256Gcm::new(&self.bundle_key());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Secret("bundle decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| AppError::Secret("bundle is not UTF-8".to_string()))
    }
}

/// SHA-256 hex digest. Used for request payload hashing when signing.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Raw HMAC-SHA256, the primitive for the signing key chain.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::from_bytes([7u8; 32])
    }

    #[test]
    fn key_hash_is_deterministic_and_keyed() {
        let a = store();
        assert_eq!(a.key_hash("sk-abc"), a.key_hash("sk-abc"));
        assert_ne!(a.key_hash("sk-abc"), a.key_hash("sk-abd"));
        let b = SecretStore::from_bytes([8u8; 32]);
        assert_ne!(a.key_hash("sk-abc"), b.key_hash("sk-abc"));
    }

    #[test]
    fn bundle_round_trip() {
        let s = store();
        let blob = s.encrypt(r#"{"access_token":"t","refresh_token":"r"}"#).unwrap();
        assert_ne!(blob, r#"{"access_token":"t","refresh_token":"r"}"#);
        let back = s.decrypt(&blob).unwrap();
        assert_eq!(back, r#"{"access_token":"t","refresh_token":"r"}"#);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let s = store();
        assert!(s.decrypt("00ff").is_err());
        assert!(s.decrypt("not hex").is_err());
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
