//! The credential store
//!
//! Process-wide front door for credentials: lookups with transparent
//! auto-refresh under double-checked per-id locking, provider
//! registration, and `{{id.key}}` template resolution into request
//! headers and parameters. Refresh failures never hand back a stale
//! value.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::object::{CredentialObject, DEFAULT_REFRESH_BUFFER_SECS};
use super::provider::{CredentialProvider, StaticProvider};
use super::secret::Secret;
use super::storage::CredentialStorage;
use super::template::{find_refs, TemplateRef};
use crate::error::CoreError;

/// How missing credentials behave during template resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Unknown identifiers fail with `CredentialNotFound`
    #[default]
    Strict,
    /// Unknown identifiers leave the template literal in place
    Lenient,
}

/// Process-wide credential store
pub struct CredentialStore {
    storage: Arc<dyn CredentialStorage>,
    providers: std::sync::RwLock<HashMap<String, Arc<dyn CredentialProvider>>>,
    /// Per-credential refresh gates for double-checked locking
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    refresh_buffer: Duration,
}

impl CredentialStore {
    /// Create a store over the given backend; the static provider is
    /// registered out of the box
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        let store = Self {
            storage,
            providers: std::sync::RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            refresh_buffer: Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS),
        };
        store.register_provider(Arc::new(StaticProvider));
        store
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Register a provider under its own id
    pub fn register_provider(&self, provider: Arc<dyn CredentialProvider>) {
        self.providers
            .write()
            .expect("provider lock poisoned")
            .insert(provider.id().to_string(), provider);
    }

    fn provider_of(&self, credential: &CredentialObject) -> Option<Arc<dyn CredentialProvider>> {
        let providers = self.providers.read().expect("provider lock poisoned");
        credential
            .provider_id
            .as_deref()
            .and_then(|id| providers.get(id).cloned())
    }

    /// Persist a credential, bumping its version
    pub async fn save_credential(&self, mut credential: CredentialObject) -> Result<(), CoreError> {
        credential.validate()?;
        if let Some(provider_id) = &credential.provider_id {
            let registered = self
                .providers
                .read()
                .expect("provider lock poisoned")
                .contains_key(provider_id);
            if !registered {
                return Err(CoreError::storage(format!(
                    "credential '{}' names unregistered provider '{}'",
                    credential.id, provider_id
                )));
            }
        }
        credential.version += 1;
        self.storage.save(&credential).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.storage.delete(id).await
    }

    pub async fn list(&self) -> Result<Vec<String>, CoreError> {
        self.storage.list().await
    }

    /// The default key's value, refreshing first when due
    pub async fn get(&self, id: &str) -> Result<Secret, CoreError> {
        let credential = self.load_fresh(id).await?;
        let key = credential
            .default_key()
            .ok_or_else(|| CoreError::credential_not_found(id))?;
        self.ensure_usable(&credential, key.is_expired())?;
        Ok(key.secret_value.clone())
    }

    /// A named key's value, refreshing first when due
    pub async fn get_key(&self, id: &str, key_name: &str) -> Result<Secret, CoreError> {
        let credential = self.load_fresh(id).await?;
        let key = credential
            .key(key_name)
            .ok_or_else(|| CoreError::credential_not_found(format!("{id}.{key_name}")))?;
        self.ensure_usable(&credential, key.is_expired())?;
        Ok(key.secret_value.clone())
    }

    /// Force a provider refresh regardless of expiry
    pub async fn refresh(&self, id: &str) -> Result<(), CoreError> {
        let credential = self
            .storage
            .load(id)
            .await?
            .ok_or_else(|| CoreError::credential_not_found(id))?;
        let provider = self.provider_of(&credential).ok_or_else(|| {
            CoreError::credential_refresh(id, "credential has no registered provider")
        })?;

        let gate = self.refresh_gate(id).await;
        let _guard = gate.lock().await;
        self.refresh_locked(&credential, provider.as_ref()).await?;
        Ok(())
    }

    /// Substitute `{{id}}` and `{{id.key}}` references in a template
    pub async fn resolve(&self, template: &str, mode: ResolveMode) -> Result<String, CoreError> {
        let refs = find_refs(template);
        if refs.is_empty() {
            return Ok(template.to_string());
        }

        let mut out = String::with_capacity(template.len());
        let mut cursor = 0;
        for (range, reference) in refs {
            out.push_str(&template[cursor..range.start]);
            match self.lookup(&reference).await {
                Ok(secret) => out.push_str(secret.reveal()),
                Err(CoreError::CredentialNotFound { .. }) if mode == ResolveMode::Lenient => {
                    out.push_str(&template[range.clone()]);
                }
                Err(err) => return Err(err),
            }
            cursor = range.end;
        }
        out.push_str(&template[cursor..]);
        Ok(out)
    }

    /// Resolve every header value; the input map is never mutated and no
    /// partial result escapes on error
    pub async fn resolve_headers(
        &self,
        headers: &BTreeMap<String, String>,
        mode: ResolveMode,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        let mut out = BTreeMap::new();
        for (name, value) in headers {
            out.insert(name.clone(), self.resolve(value, mode).await?);
        }
        Ok(out)
    }

    /// Resolve every parameter value; same guarantees as headers
    pub async fn resolve_params(
        &self,
        params: &BTreeMap<String, String>,
        mode: ResolveMode,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        self.resolve_headers(params, mode).await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn lookup(&self, reference: &TemplateRef) -> Result<Secret, CoreError> {
        match &reference.key {
            Some(key) => self.get_key(&reference.id, key).await,
            None => self.get(&reference.id).await,
        }
    }

    async fn refresh_gate(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Load a credential, auto-refreshing when due
    ///
    /// Double-checked: the expiry check runs once optimistically, then
    /// again under the per-id gate, so concurrent readers during an
    /// in-flight refresh wait instead of refreshing twice.
    async fn load_fresh(&self, id: &str) -> Result<CredentialObject, CoreError> {
        let credential = self
            .storage
            .load(id)
            .await?
            .ok_or_else(|| CoreError::credential_not_found(id))?;

        if !credential.auto_refresh {
            return Ok(credential);
        }
        let Some(provider) = self.provider_of(&credential) else {
            tracing::warn!(credential = %id, "auto-refresh credential has no registered provider");
            return Ok(credential);
        };
        if !provider.should_refresh(&credential) && !credential.needs_refresh(self.refresh_buffer)
        {
            return Ok(credential);
        }

        let gate = self.refresh_gate(id).await;
        let _guard = gate.lock().await;

        // Re-check under the gate: another caller may have refreshed
        let credential = self
            .storage
            .load(id)
            .await?
            .ok_or_else(|| CoreError::credential_not_found(id))?;
        if !provider.should_refresh(&credential) && !credential.needs_refresh(self.refresh_buffer)
        {
            return Ok(credential);
        }

        self.refresh_locked(&credential, provider.as_ref()).await
    }

    /// Perform one refresh; callers hold the per-id gate
    async fn refresh_locked(
        &self,
        credential: &CredentialObject,
        provider: &dyn CredentialProvider,
    ) -> Result<CredentialObject, CoreError> {
        tracing::info!(credential = %credential.id, provider = provider.id(), "refreshing credential");
        let mut refreshed = provider.refresh(credential).await.map_err(|err| match err {
            refresh @ CoreError::CredentialRefreshError { .. } => refresh,
            other => CoreError::credential_refresh(credential.id.clone(), other.to_string()),
        })?;
        refreshed.version = credential.version + 1;
        refreshed.last_refreshed = Some(Utc::now());
        self.storage.save(&refreshed).await?;
        Ok(refreshed)
    }

    /// A refreshed credential must actually be fresh; never return a
    /// stale value for an auto-refresh credential
    fn ensure_usable(&self, credential: &CredentialObject, expired: bool) -> Result<(), CoreError> {
        if credential.auto_refresh && expired {
            return Err(CoreError::credential_refresh(
                credential.id.clone(),
                "credential is still expired after refresh",
            ));
        }
        Ok(())
    }
}
