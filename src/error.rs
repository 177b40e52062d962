//! Error types for the agent runtime core
//!
//! Every error exposed at the public surface carries a human-readable
//! message and a stable machine code. Secret values never appear in any
//! variant; credential errors reference ids only.

use thiserror::Error;

/// Errors that can occur across the runtime core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Goal failed validation before a run was accepted
    #[error("Invalid goal: {message}")]
    GoalInvalid { message: String },

    /// Graph failed validation before a run was accepted
    #[error("Invalid graph: {message}")]
    GraphInvalid { message: String },

    /// A node visit exceeded its step or wall-clock budget
    #[error("Node {node_id} timed out")]
    NodeTimeout { node_id: String },

    /// A node was scheduled more often than its visit limit allows
    #[error("Node {node_id} exceeded max visits ({visits})")]
    NodeMaxVisits { node_id: String, visits: u32 },

    /// No outgoing edge matched the node's verdict and memory
    #[error("No valid edge out of node {node_id}")]
    NoValidEdge { node_id: String },

    /// A hard goal constraint was violated during execution
    #[error("Hard constraint {constraint_id} violated: {message}")]
    HardConstraintViolated {
        constraint_id: String,
        message: String,
    },

    /// Two parallel branches wrote the same memory key
    #[error("Branch merge conflict on key '{key}' between branches {first} and {second}")]
    BranchMergeConflict {
        key: String,
        first: String,
        second: String,
    },

    /// A tool named by a node does not resolve, or dispatch failed fatally
    #[error("Tool '{tool}' unavailable: {message}")]
    ToolUnavailable { tool: String, message: String },

    /// The LLM adapter failed in a way the node runtime cannot absorb
    #[error("LLM unavailable: {message}")]
    LlmUnavailable { message: String },

    /// No credential is stored under the given id
    #[error("Credential '{id}' not found")]
    CredentialNotFound { id: String },

    /// A provider refresh failed; the stale value is withheld
    #[error("Credential '{id}' refresh failed: {message}")]
    CredentialRefreshError { id: String, message: String },

    /// Stored ciphertext failed decryption or authentication
    #[error("Credential '{id}' is corrupt: {message}")]
    CredentialCorrupt { id: String, message: String },

    /// No session is stored under the given id
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    /// The session is in a state that does not permit resumption
    #[error("Session '{id}' is not resumable (status: {status})")]
    SessionNotResumable { id: String, status: String },

    /// A storage backend failed while persisting or loading state
    #[error("Storage failure: {message}")]
    StorageFailure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The run was cancelled
    #[error("Run cancelled")]
    Cancelled,
}

impl CoreError {
    /// Stable machine code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::GoalInvalid { .. } => "goal_invalid",
            CoreError::GraphInvalid { .. } => "graph_invalid",
            CoreError::NodeTimeout { .. } => "node_timeout",
            CoreError::NodeMaxVisits { .. } => "node_max_visits",
            CoreError::NoValidEdge { .. } => "no_valid_edge",
            CoreError::HardConstraintViolated { .. } => "hard_constraint_violated",
            CoreError::BranchMergeConflict { .. } => "branch_merge_conflict",
            CoreError::ToolUnavailable { .. } => "tool_unavailable",
            CoreError::LlmUnavailable { .. } => "llm_unavailable",
            CoreError::CredentialNotFound { .. } => "credential_not_found",
            CoreError::CredentialRefreshError { .. } => "credential_refresh_error",
            CoreError::CredentialCorrupt { .. } => "credential_corrupt",
            CoreError::SessionNotFound { .. } => "session_not_found",
            CoreError::SessionNotResumable { .. } => "session_not_resumable",
            CoreError::StorageFailure { .. } => "storage_failure",
            CoreError::Cancelled => "cancelled",
        }
    }

    /// Create a goal validation error
    pub fn goal_invalid(message: impl Into<String>) -> Self {
        Self::GoalInvalid {
            message: message.into(),
        }
    }

    /// Create a graph validation error
    pub fn graph_invalid(message: impl Into<String>) -> Self {
        Self::GraphInvalid {
            message: message.into(),
        }
    }

    /// Create a node timeout error
    pub fn node_timeout(node_id: impl Into<String>) -> Self {
        Self::NodeTimeout {
            node_id: node_id.into(),
        }
    }

    /// Create a tool unavailability error
    pub fn tool_unavailable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolUnavailable {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an LLM unavailability error
    pub fn llm_unavailable(message: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            message: message.into(),
        }
    }

    /// Create a credential-not-found error
    pub fn credential_not_found(id: impl Into<String>) -> Self {
        Self::CredentialNotFound { id: id.into() }
    }

    /// Create a credential refresh error
    pub fn credential_refresh(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CredentialRefreshError {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a credential corruption error
    pub fn credential_corrupt(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CredentialCorrupt {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a storage failure with a message only
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage failure with an underlying cause
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StorageFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the node runtime may absorb this error and keep looping
    ///
    /// Recoverable errors are surfaced to the LLM as structured tool
    /// results; everything else terminates at its tier.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::ToolUnavailable { .. }
                | CoreError::LlmUnavailable { .. }
                | CoreError::NodeTimeout { .. }
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::storage_with_source("io error", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::storage_with_source("serialization error", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Errors must be shareable across worker tasks (compile-time check)
    static_assertions::assert_impl_all!(CoreError: Send, Sync);

    #[test]
    fn test_error_display() {
        let err = CoreError::NoValidEdge {
            node_id: "intake".into(),
        };
        assert_eq!(format!("{}", err), "No valid edge out of node intake");
    }

    #[test]
    fn test_machine_codes_are_stable() {
        assert_eq!(CoreError::Cancelled.code(), "cancelled");
        assert_eq!(
            CoreError::credential_not_found("hubspot").code(),
            "credential_not_found"
        );
        assert_eq!(
            CoreError::NodeMaxVisits {
                node_id: "n".into(),
                visits: 3
            }
            .code(),
            "node_max_visits"
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(CoreError::tool_unavailable("search", "rate limited").is_recoverable());
        assert!(CoreError::llm_unavailable("503").is_recoverable());
        assert!(CoreError::node_timeout("slow").is_recoverable());

        assert!(!CoreError::Cancelled.is_recoverable());
        assert!(!CoreError::graph_invalid("dangling edge").is_recoverable());
        assert!(!CoreError::storage("disk full").is_recoverable());
    }

    #[test]
    fn test_storage_failure_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = CoreError::storage_with_source("checkpoint write failed", io);
        match err {
            CoreError::StorageFailure { source, .. } => assert!(source.is_some()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_credential_errors_reference_id_only() {
        let err = CoreError::credential_refresh("hubspot", "provider returned 401");
        let rendered = format!("{}", err);
        assert!(rendered.contains("hubspot"));
        assert!(!rendered.contains("sk-"));
    }
}
