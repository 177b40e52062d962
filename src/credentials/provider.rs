//! Credential providers
//!
//! A provider owns the lifecycle of the credentials it supports: refresh,
//! validation, and revocation. The static provider is the default for
//! credentials that never rotate.

use async_trait::async_trait;
use chrono::Duration;

use super::object::{CredentialKind, CredentialObject, DEFAULT_REFRESH_BUFFER_SECS};
use crate::error::CoreError;

/// Lifecycle operations for a family of credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Provider id referenced by `CredentialObject::provider_id`
    fn id(&self) -> &str;

    /// Credential kinds this provider can manage
    fn supported_kinds(&self) -> &[CredentialKind];

    /// Produce a refreshed credential; must bump the version
    async fn refresh(&self, credential: &CredentialObject)
        -> Result<CredentialObject, CoreError>;

    /// Whether the credential is currently usable
    async fn validate(&self, credential: &CredentialObject) -> bool {
        credential
            .default_key()
            .map(|k| !k.is_expired())
            .unwrap_or(false)
    }

    /// Whether a refresh is due; default uses the standard buffer
    fn should_refresh(&self, credential: &CredentialObject) -> bool {
        credential.needs_refresh(Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS))
    }

    /// Revoke the credential upstream; returns whether anything happened
    async fn revoke(&self, _credential: &CredentialObject) -> Result<bool, CoreError> {
        Ok(false)
    }
}

/// Default provider for credentials that never rotate
pub struct StaticProvider;

/// Id under which [`StaticProvider`] registers
pub const STATIC_PROVIDER_ID: &str = "static";

const STATIC_KINDS: &[CredentialKind] = &[
    CredentialKind::ApiKey,
    CredentialKind::Custom,
];

#[async_trait]
impl CredentialProvider for StaticProvider {
    fn id(&self) -> &str {
        STATIC_PROVIDER_ID
    }

    fn supported_kinds(&self) -> &[CredentialKind] {
        STATIC_KINDS
    }

    async fn refresh(
        &self,
        credential: &CredentialObject,
    ) -> Result<CredentialObject, CoreError> {
        Err(CoreError::credential_refresh(
            credential.id.clone(),
            "static credentials cannot be refreshed",
        ))
    }

    fn should_refresh(&self, _credential: &CredentialObject) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::object::CredentialKey;
    use chrono::Utc;

    #[tokio::test]
    async fn test_static_provider_never_refreshes() {
        let provider = StaticProvider;
        let cred = CredentialObject::api_key("c", "v");
        assert!(!provider.should_refresh(&cred));
        assert!(provider.refresh(&cred).await.is_err());
    }

    #[tokio::test]
    async fn test_default_validate_checks_expiry() {
        let provider = StaticProvider;

        let live = CredentialObject::api_key("c", "v");
        assert!(provider.validate(&live).await);

        let dead = CredentialObject::new("c", CredentialKind::ApiKey).with_key(
            CredentialKey::new("api_key", "v").with_expiry(Utc::now() - Duration::seconds(10)),
        );
        assert!(!provider.validate(&dead).await);
    }
}
