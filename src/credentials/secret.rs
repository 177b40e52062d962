//! Opaque secret values
//!
//! Wraps sensitive strings so they cannot leak through Debug, Display, or
//! serialization; the only way out is [`Secret::reveal`], which keeps
//! every use greppable. Values are zeroed in memory on drop.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string that renders as `[REDACTED]` everywhere except
/// [`Secret::reveal`]
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    inner: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Expose the secret value
    ///
    /// The name is deliberately loud; call sites are the audit trail.
    /// The revealed value must never reach logs or error messages.
    pub fn reveal(&self) -> &str {
        &self.inner
    }

    /// Constant-time comparison against another secret
    pub fn constant_time_eq(&self, other: &Secret) -> bool {
        use subtle::ConstantTimeEq;
        self.inner.as_bytes().ct_eq(other.inner.as_bytes()).into()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// Public serialization redacts; storage backends use their own private
// representation to persist real values
impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        Ok(Secret::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_and_display_redact() {
        let secret = Secret::new("sk-live-12345");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn test_serialize_redacts() {
        let secret = Secret::new("token-value");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
        assert!(!json.contains("token-value"));
    }

    #[test]
    fn test_reveal_returns_value() {
        let secret = Secret::new("the-value");
        assert_eq!(secret.reveal(), "the-value");
    }

    #[test]
    fn test_constant_time_eq() {
        let a = Secret::new("same");
        let b = Secret::new("same");
        let c = Secret::new("different");
        assert!(a.constant_time_eq(&b));
        assert!(!a.constant_time_eq(&c));
    }

    #[test]
    fn test_deserialize_accepts_plain_string() {
        let secret: Secret = serde_json::from_str("\"from-json\"").unwrap();
        assert_eq!(secret.reveal(), "from-json");
    }

    #[test]
    fn test_secret_in_struct_does_not_leak() {
        #[derive(Debug, Serialize)]
        struct Holder {
            name: String,
            secret: Secret,
        }

        let holder = Holder {
            name: "api".into(),
            secret: Secret::new("sk-hidden"),
        };
        let debug = format!("{holder:?}");
        let json = serde_json::to_string(&holder).unwrap();
        assert!(!debug.contains("sk-hidden"));
        assert!(!json.contains("sk-hidden"));
    }
}
