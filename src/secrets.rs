//! Credential codec with encryption at rest
//!
//! Connection secrets (passwords, API keys, client secrets, service-account
//! keys) are stored as AES-256-GCM envelopes. The codec holds the current key
//! plus a short list of previous keys so blobs written before a rotation stay
//! readable until they are re-encrypted.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{Context, Result};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::catalog::Field;

/// Length of encryption key in bytes (256 bits)
const KEY_LENGTH: usize = 32;
/// Length of nonce in bytes (96 bits)
const NONCE_LENGTH: usize = 12;
/// Prefix for encrypted values in storage
const ENCRYPTED_PREFIX: &str = "enc:v1:";
/// Number of retired keys kept for decryption
const MAX_PREVIOUS_KEYS: usize = 5;

/// Decryption or key failures
///
/// Messages never include plaintext or key material.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("ciphertext is not a recognised envelope")]
    Malformed,
    #[error("ciphertext was written with unknown key {0}")]
    UnknownKey(String),
    #[error("ciphertext failed authentication (tampered or wrong key)")]
    DecryptionFailed,
    #[error("decrypted payload is not a valid secret")]
    InvalidPayload,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Secret material attached to a connection
///
/// The variant carries the category's meaning, so a client secret is never
/// mistaken for a database password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Secret {
    Password(String),
    ApiKey(String),
    ClientSecret(String),
    AccessKeySecret(String),
    /// JSON service-account key document
    ServiceAccountKey(String),
}

impl Secret {
    /// The catalog field this secret satisfies
    pub fn field(&self) -> Field {
        match self {
            Secret::Password(_) => Field::Password,
            Secret::ApiKey(_) => Field::ApiKey,
            Secret::ClientSecret(_) => Field::ClientSecret,
            Secret::AccessKeySecret(_) => Field::AccessKeySecret,
            Secret::ServiceAccountKey(_) => Field::ServiceAccountKey,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Secret::Password(_) => "password",
            Secret::ApiKey(_) => "api_key",
            Secret::ClientSecret(_) => "client_secret",
            Secret::AccessKeySecret(_) => "access_key_secret",
            Secret::ServiceAccountKey(_) => "service_account_key",
        }
    }

    /// Borrow the plaintext value
    pub fn expose(&self) -> &str {
        match self {
            Secret::Password(v)
            | Secret::ApiKey(v)
            | Secret::ClientSecret(v)
            | Secret::AccessKeySecret(v)
            | Secret::ServiceAccountKey(v) => v,
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret::{}(<redacted>)", self.kind())
    }
}

/// Encryption key for secrets
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; KEY_LENGTH],
    id: String,
    created_at: String,
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);

        Self {
            key,
            id: uuid::Uuid::new_v4().simple().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8], id: String, created_at: String) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            anyhow::bail!("Invalid key length: expected {}, got {}", KEY_LENGTH, bytes.len());
        }
        if id.contains(':') {
            anyhow::bail!("Key id must not contain ':'");
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);

        Ok(Self { key, id, created_at })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Export key as base64
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.key)
    }

    /// Import key from base64
    pub fn from_base64(encoded: &str, id: String, created_at: String) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("Failed to decode base64 key")?;
        Self::from_bytes(&bytes, id, created_at)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

/// Symmetric codec for connection secrets
#[derive(Clone)]
pub struct CredentialCodec {
    current_key: EncryptionKey,
    previous_keys: Vec<EncryptionKey>,
}

impl CredentialCodec {
    /// Create a codec with a fresh key
    pub fn new() -> Self {
        Self::with_key(EncryptionKey::generate())
    }

    /// Create from an existing key
    pub fn with_key(key: EncryptionKey) -> Self {
        Self {
            current_key: key,
            previous_keys: Vec::new(),
        }
    }

    /// Build from a base64 key held in an environment variable
    ///
    /// The key id is derived from the key bytes so blobs written by one
    /// process are readable by the next one started with the same variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = std::env::var(var)
            .with_context(|| format!("Environment variable {} is not set", var))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .with_context(|| format!("{} is not valid base64", var))?;
        let id = derived_key_id(&bytes);
        let key = EncryptionKey::from_bytes(&bytes, id, chrono::Utc::now().to_rfc3339())?;
        Ok(Self::with_key(key))
    }

    /// Load the codec from a key file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read key file")?;

        let key_data: KeyFileData =
            serde_json::from_str(&content).context("Failed to parse key file")?;

        let current_key = EncryptionKey::from_base64(
            &key_data.current_key,
            key_data.current_key_id,
            key_data.current_key_created_at,
        )?;

        let mut previous_keys = Vec::new();
        for prev in key_data.previous_keys {
            let key = EncryptionKey::from_base64(&prev.key, prev.id, prev.created_at)
                .context("Invalid previous key in key file")?;
            previous_keys.push(key);
        }

        info!(
            path = %path.display(),
            key_id = current_key.id(),
            created_at = current_key.created_at(),
            previous_keys = previous_keys.len(),
            "Loaded credential keys"
        );

        Ok(Self {
            current_key,
            previous_keys,
        })
    }

    /// Save keys to a file readable only by the owner
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let key_data = KeyFileData {
            current_key: self.current_key.to_base64(),
            current_key_id: self.current_key.id.clone(),
            current_key_created_at: self.current_key.created_at.clone(),
            previous_keys: self
                .previous_keys
                .iter()
                .map(|k| PreviousKeyData {
                    key: k.to_base64(),
                    id: k.id.clone(),
                    created_at: k.created_at.clone(),
                })
                .collect(),
        };

        let content = serde_json::to_string_pretty(&key_data)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write atomically
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&tmp_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms)?;
        }

        std::fs::rename(&tmp_path, path)?;

        info!(
            path = %path.display(),
            key_id = self.current_key.id(),
            created_at = self.current_key.created_at(),
            "Saved credential keys"
        );
        Ok(())
    }

    pub fn current_key_id(&self) -> &str {
        self.current_key.id()
    }

    /// Rotate to a new key, keeping the old one for decryption
    pub fn rotate_key(&mut self) -> &EncryptionKey {
        let old_key = std::mem::replace(&mut self.current_key, EncryptionKey::generate());
        self.previous_keys.insert(0, old_key);
        self.previous_keys.truncate(MAX_PREVIOUS_KEYS);

        info!(
            new_key_id = self.current_key.id(),
            previous_keys = self.previous_keys.len(),
            "Rotated credential key"
        );

        &self.current_key
    }

    /// Encrypt a plaintext string into an envelope
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .current_key
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::EncryptionFailed)?;

        // Format: enc:v1:<key_id>:<nonce_base64>:<ciphertext_base64>
        let engine = base64::engine::general_purpose::STANDARD;
        Ok(format!(
            "{}{}:{}:{}",
            ENCRYPTED_PREFIX,
            self.current_key.id(),
            engine.encode(nonce_bytes),
            engine.encode(ciphertext)
        ))
    }

    /// Decrypt an envelope produced by [`CredentialCodec::encrypt`]
    pub fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let data = encrypted
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or(CredentialError::Malformed)?;

        let parts: Vec<&str> = data.splitn(3, ':').collect();
        let [key_id, nonce_b64, cipher_b64] = parts[..] else {
            return Err(CredentialError::Malformed);
        };

        let key = if self.current_key.id() == key_id {
            &self.current_key
        } else {
            self.previous_keys
                .iter()
                .find(|k| k.id() == key_id)
                .ok_or_else(|| CredentialError::UnknownKey(key_id.to_string()))?
        };

        let engine = base64::engine::general_purpose::STANDARD;
        let nonce_bytes = engine
            .decode(nonce_b64)
            .map_err(|_| CredentialError::Malformed)?;
        let ciphertext = engine
            .decode(cipher_b64)
            .map_err(|_| CredentialError::Malformed)?;

        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(CredentialError::Malformed);
        }

        let plaintext = key
            .cipher()
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CredentialError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::InvalidPayload)
    }

    /// Encrypt a typed secret for storage
    pub fn seal(&self, secret: &Secret) -> Result<String, CredentialError> {
        let payload =
            serde_json::to_string(secret).map_err(|_| CredentialError::EncryptionFailed)?;
        self.encrypt(&payload)
    }

    /// Decrypt a stored blob back into a typed secret
    pub fn open(&self, encrypted: &str) -> Result<Secret, CredentialError> {
        let payload = self.decrypt(encrypted)?;
        serde_json::from_str(&payload).map_err(|_| CredentialError::InvalidPayload)
    }

    /// Check if a value carries the envelope prefix
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    /// Re-encrypt a value with the current key
    pub fn re_encrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let plaintext = self.decrypt(encrypted)?;
        self.encrypt(&plaintext)
    }
}

impl Default for CredentialCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("current_key_id", &self.current_key.id)
            .field("previous_keys", &self.previous_keys.len())
            .finish()
    }
}

/// Key id for keys that arrive without one
fn derived_key_id(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    format!("env{}", &hex::encode(digest)[..12])
}

/// Key file format for persistence
#[derive(Serialize, Deserialize)]
struct KeyFileData {
    current_key: String,
    current_key_id: String,
    current_key_created_at: String,
    #[serde(default)]
    previous_keys: Vec<PreviousKeyData>,
}

#[derive(Serialize, Deserialize)]
struct PreviousKeyData {
    key: String,
    id: String,
    created_at: String,
}
