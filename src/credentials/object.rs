//! Credential objects and keys
//!
//! A credential object bundles one or more named keys with optional
//! expiries under a single id, optionally bound to a provider that can
//! refresh it. Identity is `(id, version)`; secret bytes never take part
//! in equality or hashing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::secret::Secret;
use crate::error::CoreError;

/// Refresh is due when any key expires within this buffer
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 300;

/// Kind of credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Oauth2,
    Custom,
}

/// One named key inside a credential object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialKey {
    pub name: String,
    pub secret_value: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialKey {
    pub fn new(name: impl Into<String>, secret_value: impl Into<Secret>) -> Self {
        Self {
            name: name.into(),
            secret_value: secret_value.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the key's expiry has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now(),
            None => false,
        }
    }

    /// Whether the key expires within the buffer
    pub fn expires_within(&self, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Utc::now() <= buffer,
            None => false,
        }
    }
}

/// A named bundle of credential keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialObject {
    pub id: String,
    pub kind: CredentialKind,
    /// Keys by name; BTreeMap keeps "first defined key" deterministic
    pub keys: BTreeMap<String, CredentialKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<DateTime<Utc>>,
    /// Bumped on every save/refresh; part of identity
    #[serde(default)]
    pub version: u64,
}

impl CredentialObject {
    pub fn new(id: impl Into<String>, kind: CredentialKind) -> Self {
        Self {
            id: id.into(),
            kind,
            keys: BTreeMap::new(),
            provider_id: None,
            auto_refresh: false,
            last_refreshed: None,
            version: 0,
        }
    }

    /// Convenience constructor for a single-key api credential
    pub fn api_key(id: impl Into<String>, value: impl Into<Secret>) -> Self {
        Self::new(id, CredentialKind::ApiKey).with_key(CredentialKey::new("api_key", value))
    }

    pub fn with_key(mut self, key: CredentialKey) -> Self {
        self.keys.insert(key.name.clone(), key);
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn key(&self, name: &str) -> Option<&CredentialKey> {
        self.keys.get(name)
    }

    /// The default key: `api_key`, then `access_token`, then the first
    /// defined key in name order
    pub fn default_key(&self) -> Option<&CredentialKey> {
        self.keys
            .get("api_key")
            .or_else(|| self.keys.get("access_token"))
            .or_else(|| self.keys.values().next())
    }

    /// Whether any key is due for refresh within the buffer
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        self.keys.values().any(|k| k.expires_within(buffer))
    }

    /// Invariants checked before a save is accepted
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::storage("credential id must not be empty"));
        }
        if self.keys.is_empty() {
            return Err(CoreError::storage(format!(
                "credential '{}' must have at least one key",
                self.id
            )));
        }
        for key in self.keys.values() {
            if key.secret_value.is_empty() {
                return Err(CoreError::storage(format!(
                    "credential '{}' key '{}' has an empty secret",
                    self.id, key.name
                )));
            }
        }
        Ok(())
    }
}

// Identity over (id, version); secret bytes never participate
impl PartialEq for CredentialObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}

impl Eq for CredentialObject {}

impl std::hash::Hash for CredentialObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.version.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_checks() {
        let fresh = CredentialKey::new("k", "v").with_expiry(Utc::now() + Duration::hours(1));
        assert!(!fresh.is_expired());
        assert!(!fresh.expires_within(Duration::seconds(300)));
        assert!(fresh.expires_within(Duration::hours(2)));

        let stale = CredentialKey::new("k", "v").with_expiry(Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());

        let eternal = CredentialKey::new("k", "v");
        assert!(!eternal.is_expired());
        assert!(!eternal.expires_within(Duration::days(365)));
    }

    #[test]
    fn test_default_key_preference() {
        let cred = CredentialObject::new("c", CredentialKind::Oauth2)
            .with_key(CredentialKey::new("refresh_token", "r"))
            .with_key(CredentialKey::new("access_token", "a"));
        assert_eq!(cred.default_key().unwrap().name, "access_token");

        let cred = CredentialObject::api_key("c", "k").with_key(CredentialKey::new("other", "o"));
        assert_eq!(cred.default_key().unwrap().name, "api_key");

        let cred =
            CredentialObject::new("c", CredentialKind::Custom).with_key(CredentialKey::new("zz", "v"));
        assert_eq!(cred.default_key().unwrap().name, "zz");
    }

    #[test]
    fn test_needs_refresh_any_key() {
        let cred = CredentialObject::new("c", CredentialKind::Oauth2)
            .with_key(CredentialKey::new("access_token", "a").with_expiry(Utc::now() + Duration::seconds(30)))
            .with_key(CredentialKey::new("refresh_token", "r"));
        assert!(cred.needs_refresh(Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS)));

        let cred = CredentialObject::api_key("c", "k");
        assert!(!cred.needs_refresh(Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS)));
    }

    #[test]
    fn test_validate_requires_a_key() {
        let empty = CredentialObject::new("c", CredentialKind::ApiKey);
        assert!(empty.validate().is_err());

        let blank_secret =
            CredentialObject::new("c", CredentialKind::ApiKey).with_key(CredentialKey::new("k", ""));
        assert!(blank_secret.validate().is_err());

        assert!(CredentialObject::api_key("c", "value").validate().is_ok());
    }

    #[test]
    fn test_identity_over_id_and_version() {
        let mut a = CredentialObject::api_key("c", "secret-one");
        let mut b = CredentialObject::api_key("c", "secret-two");
        a.version = 1;
        b.version = 1;
        // Different secrets, same identity
        assert_eq!(a, b);

        b.version = 2;
        assert_ne!(a, b);
    }

    #[test]
    fn test_public_serialization_redacts_secrets() {
        let cred = CredentialObject::api_key("c", "sk-live-secret");
        let json = serde_json::to_string(&cred).unwrap();
        assert!(!json.contains("sk-live-secret"));
        assert!(json.contains("[REDACTED]"));
    }
}
