//! Credential storage backends
//!
//! The encrypted-file backend protects credentials at rest with
//! AES-256-GCM (unique nonce per write, authenticated ciphertext) and
//! keeps only a cleartext index of ids. Tampered or undecryptable blobs
//! surface as `CredentialCorrupt`, never as silent omission. Also
//! provided: a read-only environment backend, an in-memory backend, and
//! a layered composite.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroize;

use super::object::{CredentialKey, CredentialKind, CredentialObject};
use super::secret::Secret;
use crate::error::CoreError;

/// Abstract persistence for credential objects
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Load by id; `None` when absent, `CredentialCorrupt` when present
    /// but unreadable
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>, CoreError>;

    async fn save(&self, credential: &CredentialObject) -> Result<(), CoreError>;

    async fn delete(&self, id: &str) -> Result<(), CoreError>;

    async fn list(&self) -> Result<Vec<String>, CoreError>;
}

// ---------------------------------------------------------------------------
// Storage representation
// ---------------------------------------------------------------------------

// The public CredentialObject serialization redacts secrets; persistence
// goes through this private mirror that carries real values. It only
// ever exists inside a backend, between serialization and encryption.

#[derive(Serialize, Deserialize)]
struct StoredKey {
    name: String,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    id: String,
    kind: CredentialKind,
    keys: BTreeMap<String, StoredKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_id: Option<String>,
    #[serde(default)]
    auto_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refreshed: Option<DateTime<Utc>>,
    #[serde(default)]
    version: u64,
}

impl StoredCredential {
    fn from_object(credential: &CredentialObject) -> Self {
        Self {
            id: credential.id.clone(),
            kind: credential.kind,
            keys: credential
                .keys
                .iter()
                .map(|(name, key)| {
                    (
                        name.clone(),
                        StoredKey {
                            name: key.name.clone(),
                            value: key.secret_value.reveal().to_string(),
                            expires_at: key.expires_at,
                        },
                    )
                })
                .collect(),
            provider_id: credential.provider_id.clone(),
            auto_refresh: credential.auto_refresh,
            last_refreshed: credential.last_refreshed,
            version: credential.version,
        }
    }

    fn into_object(self) -> CredentialObject {
        CredentialObject {
            id: self.id,
            kind: self.kind,
            keys: self
                .keys
                .into_iter()
                .map(|(name, key)| {
                    (
                        name,
                        CredentialKey {
                            name: key.name,
                            secret_value: Secret::new(key.value),
                            expires_at: key.expires_at,
                        },
                    )
                })
                .collect(),
            provider_id: self.provider_id,
            auto_refresh: self.auto_refresh,
            last_refreshed: self.last_refreshed,
            version: self.version,
        }
    }
}

// ---------------------------------------------------------------------------
// Encryption key
// ---------------------------------------------------------------------------

/// Process-wide AES-256 key for the encrypted backend
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        use aes_gcm::aead::rand_core::RngCore;
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Decode a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self, CoreError> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| CoreError::storage("encryption key is not valid base64"))?;
        if decoded.len() != 32 {
            return Err(CoreError::storage("encryption key must be 32 bytes"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Load a base64 key from an environment variable
    pub fn from_env(var_name: &str) -> Result<Self, CoreError> {
        let encoded = std::env::var(var_name)
            .map_err(|_| CoreError::storage(format!("env var '{var_name}' is not set")))?;
        Self::from_base64(&encoded)
    }

    /// Base64 form for operator persistence
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Encrypted file backend
// ---------------------------------------------------------------------------

/// AES-256-GCM encrypted file storage with a cleartext id index
///
/// Layout: `{dir}/index.json` lists ids; `{dir}/{id}.cred` holds
/// base64(nonce ‖ ciphertext) of the credential JSON.
pub struct EncryptedFileStorage {
    dir: PathBuf,
    cipher: Aes256Gcm,
}

impl EncryptedFileStorage {
    /// Open the backend with an explicit key
    pub fn new(dir: impl Into<PathBuf>, key: EncryptionKey) -> Self {
        Self {
            dir: dir.into(),
            cipher: key.cipher(),
        }
    }

    /// Open the backend, generating a key when none is supplied
    ///
    /// The generated key is logged once (base64) so the operator can
    /// persist it; credentials written under a lost key are unreadable.
    pub fn with_generated_key(dir: impl Into<PathBuf>) -> Self {
        let key = EncryptionKey::generate();
        tracing::warn!(
            key = %key.to_base64(),
            "no credential encryption key configured; generated one for this process. \
             Persist it (e.g. in the environment) or stored credentials will be unreadable \
             after restart"
        );
        Self::new(dir, key)
    }

    fn credential_path(&self, id: &str) -> Result<PathBuf, CoreError> {
        validate_credential_id(id)?;
        Ok(self.dir.join(format!("{id}.cred")))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CoreError> {
        use aes_gcm::aead::rand_core::RngCore;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CoreError::storage("credential encryption failed"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    fn decrypt(&self, id: &str, encoded: &str) -> Result<Vec<u8>, CoreError> {
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|_| CoreError::credential_corrupt(id, "stored blob is not valid base64"))?;
        if combined.len() < 12 {
            return Err(CoreError::credential_corrupt(id, "stored blob is truncated"));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                CoreError::credential_corrupt(id, "decryption or authentication failed")
            })
    }

    async fn write_atomic(&self, path: &PathBuf, bytes: &[u8]) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to create credential dir", e))?;
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to create temp file", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to write temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| CoreError::storage_with_source("failed to sync temp file", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to rename temp file", e))?;
        Ok(())
    }

    async fn read_index(&self) -> Result<Vec<String>, CoreError> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::storage_with_source("credential index is corrupt", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CoreError::storage_with_source(
                "failed to read credential index",
                e,
            )),
        }
    }

    async fn write_index(&self, index: &[String]) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(index)?;
        self.write_atomic(&self.index_path(), &bytes).await
    }
}

#[async_trait]
impl CredentialStorage for EncryptedFileStorage {
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>, CoreError> {
        let path = self.credential_path(id)?;
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::storage_with_source(
                    "failed to read credential file",
                    e,
                ))
            }
        };

        let plaintext = self.decrypt(id, &encoded)?;
        let stored: StoredCredential = serde_json::from_slice(&plaintext)
            .map_err(|_| CoreError::credential_corrupt(id, "decrypted payload is not valid JSON"))?;
        Ok(Some(stored.into_object()))
    }

    async fn save(&self, credential: &CredentialObject) -> Result<(), CoreError> {
        credential.validate()?;
        let stored = StoredCredential::from_object(credential);
        let plaintext = serde_json::to_vec(&stored)?;
        let encoded = self.encrypt(&plaintext)?;
        self.write_atomic(&self.credential_path(&credential.id)?, encoded.as_bytes())
            .await?;

        let mut index = self.read_index().await?;
        if !index.contains(&credential.id) {
            index.push(credential.id.clone());
            index.sort();
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let path = self.credential_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::storage_with_source(
                    "failed to delete credential file",
                    e,
                ))
            }
        }
        let mut index = self.read_index().await?;
        index.retain(|existing| existing != id);
        self.write_index(&index).await
    }

    async fn list(&self) -> Result<Vec<String>, CoreError> {
        self.read_index().await
    }
}

// ---------------------------------------------------------------------------
// Environment backend
// ---------------------------------------------------------------------------

/// Read-only backend mapping credential ids to environment variables
pub struct EnvCredentialStorage {
    mappings: HashMap<String, String>,
}

impl EnvCredentialStorage {
    pub fn new() -> Self {
        Self {
            mappings: HashMap::new(),
        }
    }

    /// Map a credential id to the environment variable holding its value
    pub fn with_mapping(mut self, id: impl Into<String>, var: impl Into<String>) -> Self {
        self.mappings.insert(id.into(), var.into());
        self
    }
}

impl Default for EnvCredentialStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStorage for EnvCredentialStorage {
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>, CoreError> {
        let Some(var) = self.mappings.get(id) else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Some(CredentialObject::api_key(id, value))),
            _ => Ok(None),
        }
    }

    async fn save(&self, credential: &CredentialObject) -> Result<(), CoreError> {
        Err(CoreError::storage(format!(
            "environment credential storage is read-only (saving '{}')",
            credential.id
        )))
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        Err(CoreError::storage(format!(
            "environment credential storage is read-only (deleting '{id}')"
        )))
    }

    async fn list(&self) -> Result<Vec<String>, CoreError> {
        let mut ids: Vec<String> = self
            .mappings
            .iter()
            .filter(|(_, var)| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Ephemeral backend for tests and single-process use
#[derive(Default)]
pub struct MemoryCredentialStorage {
    credentials: std::sync::RwLock<HashMap<String, CredentialObject>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStorage for MemoryCredentialStorage {
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>, CoreError> {
        Ok(self
            .credentials
            .read()
            .expect("credential lock poisoned")
            .get(id)
            .cloned())
    }

    async fn save(&self, credential: &CredentialObject) -> Result<(), CoreError> {
        credential.validate()?;
        self.credentials
            .write()
            .expect("credential lock poisoned")
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.credentials
            .write()
            .expect("credential lock poisoned")
            .remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CoreError> {
        let mut ids: Vec<String> = self
            .credentials
            .read()
            .expect("credential lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Layered backend
// ---------------------------------------------------------------------------

/// Composite backend: reads try the primary then each fallback; writes
/// and deletes go to the primary only
pub struct LayeredCredentialStorage {
    primary: Arc<dyn CredentialStorage>,
    fallbacks: Vec<Arc<dyn CredentialStorage>>,
}

impl LayeredCredentialStorage {
    pub fn new(primary: Arc<dyn CredentialStorage>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn CredentialStorage>) -> Self {
        self.fallbacks.push(fallback);
        self
    }
}

#[async_trait]
impl CredentialStorage for LayeredCredentialStorage {
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>, CoreError> {
        if let Some(credential) = self.primary.load(id).await? {
            return Ok(Some(credential));
        }
        for fallback in &self.fallbacks {
            if let Some(credential) = fallback.load(id).await? {
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }

    async fn save(&self, credential: &CredentialObject) -> Result<(), CoreError> {
        self.primary.save(credential).await
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.primary.delete(id).await
    }

    async fn list(&self) -> Result<Vec<String>, CoreError> {
        let mut ids = self.primary.list().await?;
        for fallback in &self.fallbacks {
            for id in fallback.list().await? {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Credential ids become file names; keep them path-safe
fn validate_credential_id(id: &str) -> Result<(), CoreError> {
    if id.trim().is_empty() {
        return Err(CoreError::storage("credential id cannot be empty"));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.starts_with('.') {
        return Err(CoreError::storage(format!(
            "invalid credential id '{id}': path traversal detected"
        )));
    }
    if id.contains('\0') {
        return Err(CoreError::storage("invalid credential id: null byte"));
    }
    Ok(())
}
