//! Credential store
//!
//! Encrypted multi-key credential objects with pluggable providers and
//! `{{id.key}}` template resolution. Secrets are opaque wrappers whose
//! only exit is [`Secret::reveal`]; no error message, log line, or
//! public serialization ever carries secret bytes.

mod object;
mod provider;
mod secret;
mod storage;
mod store;
mod template;

pub use object::{
    CredentialKey, CredentialKind, CredentialObject, DEFAULT_REFRESH_BUFFER_SECS,
};
pub use provider::{CredentialProvider, StaticProvider, STATIC_PROVIDER_ID};
pub use secret::Secret;
pub use storage::{
    CredentialStorage, EncryptedFileStorage, EncryptionKey, EnvCredentialStorage,
    LayeredCredentialStorage, MemoryCredentialStorage,
};
pub use store::{CredentialStore, ResolveMode};
