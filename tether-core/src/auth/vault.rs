//! Encrypted-at-rest storage for the shared secret.
//!
//! - Argon2id (19 MiB, 2 iterations, 1 lane) derives a 32-byte key from a
//!   user/machine scope string and a per-record random salt
//! - ChaCha20-Poly1305 seals the secret under a random nonce
//!
//! Record layout: `v1:` + base64(`salt[16] || nonce[12] || ciphertext`).
//! Opening a record on another machine or as another user fails.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::TetherError;

const RECORD_PREFIX: &str = "v1:";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

const ARGON2_MEMORY_KB: u32 = 19456;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

// ── Secret ───────────────────────────────────────────────────────

/// Plaintext shared secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

// ── CredentialVault ──────────────────────────────────────────────

/// Seals and opens secrets bound to a user/machine scope.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    scope: String,
}

impl CredentialVault {
    /// Scope records to the current OS user on this host.
    pub fn for_current_user() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self::with_scope(format!("{user}@{host}:tether"))
    }

    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Encrypt `secret` into a persistable record.
    pub fn seal(&self, secret: &Secret) -> Result<String, TetherError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|_| TetherError::Vault("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{RECORD_PREFIX}{}", BASE64.encode(blob)))
    }

    /// Decrypt a record produced by [`seal`](Self::seal).
    pub fn open(&self, record: &str) -> Result<Secret, TetherError> {
        let encoded = record
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| TetherError::Vault("unknown record version".into()))?;
        let blob = BASE64
            .decode(encoded.trim())
            .map_err(|e| TetherError::Vault(format!("invalid record encoding: {e}")))?;
        if blob.len() < SALT_LEN + NONCE_LEN {
            return Err(TetherError::Vault(format!(
                "record too short: {} bytes",
                blob.len()
            )));
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TetherError::Vault("decryption failed; record belongs to another user or machine".into()))?;
        Ok(Secret::new(plaintext))
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; 32], TetherError> {
        let params = Params::new(ARGON2_MEMORY_KB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, Some(32))
            .map_err(|e| TetherError::Vault(format!("invalid argon2 params: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(self.scope.as_bytes(), salt, &mut key)
            .map_err(|e| TetherError::Vault(format!("key derivation failed: {e}")))?;
        Ok(key)
    }
}
