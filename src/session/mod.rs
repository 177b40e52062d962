//! Sessions, execution state, and checkpoints
//!
//! A session is the durable envelope around a run: identifier, status,
//! the latest execution state, and an ordered checkpoint list. Any
//! checkpoint is a complete resumption point; recovering from one
//! discards everything after it.

mod store;

pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::NodeId;
use crate::judge::Verdict;
use crate::memory::Memory;
use crate::runtime::Conversation;

/// Sortable session identifier: zero-padded creation milliseconds plus a
/// random suffix, so lexicographic order is creation order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0);
        let suffix: u32 = rand::random();
        Self(format!("{millis:013}-{suffix:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Interrupted runs are resumable; finished ones are not
    pub fn is_resumable(&self) -> bool {
        matches!(self, SessionStatus::Paused | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a checkpoint was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    NodeEntry,
    NodeComplete,
    Pause,
    Periodic,
}

/// Serialized partial state of a suspended event-loop visit
///
/// Resuming re-enters the loop with this state; the visit count is not
/// incremented again because the resumed visit is a continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedVisit {
    pub node_id: NodeId,
    pub conversation: Conversation,
    pub steps_taken: u32,
    pub attempt: u32,
    #[serde(default)]
    pub feedback: Vec<String>,
    /// A user-input request was emitted and no input has arrived yet
    pub awaiting_user_input: bool,
    /// User input was received earlier in this visit
    #[serde(default)]
    pub input_received: bool,
    #[serde(default)]
    pub outputs_written: bool,
}

/// Complete state of a run at a boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub input: Value,
    pub memory: Memory,
    pub visit_counts: BTreeMap<NodeId, u32>,
    pub last_node_id: Option<NodeId>,
    pub last_verdict: Option<Verdict>,
    pub step_counter: u64,
    pub completed_nodes: BTreeSet<NodeId>,
    pub paused_at: Option<NodeId>,
    pub failed_nodes: BTreeMap<NodeId, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_visit: Option<SuspendedVisit>,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>, input: Value) -> Self {
        let mut memory = Memory::new();
        memory.seed_input(&input);
        Self {
            run_id: run_id.into(),
            input,
            memory,
            visit_counts: BTreeMap::new(),
            last_node_id: None,
            last_verdict: None,
            step_counter: 0,
            completed_nodes: BTreeSet::new(),
            paused_at: None,
            failed_nodes: BTreeMap::new(),
            suspended_visit: None,
        }
    }

    /// Visits recorded for a node so far
    pub fn visits(&self, node_id: &NodeId) -> u32 {
        self.visit_counts.get(node_id).copied().unwrap_or(0)
    }

    /// Record one more visit and return the new count
    pub fn record_visit(&mut self, node_id: &NodeId) -> u32 {
        let count = self.visit_counts.entry(node_id.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

/// A durable resumption point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub kind: CheckpointKind,
    pub ts: DateTime<Utc>,
    pub state: ExecutionState,
}

impl Checkpoint {
    pub fn new(kind: CheckpointKind, state: ExecutionState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            ts: Utc::now(),
            state,
        }
    }
}

/// The durable envelope around a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub agent_name: String,
    pub status: SessionStatus,
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(agent_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        Self {
            session_id: SessionId::generate(),
            agent_name: agent_name.into(),
            status: SessionStatus::Active,
            execution_state: ExecutionState::new(run_id, input),
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent checkpoint, if any
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Find a checkpoint by id
    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == checkpoint_id)
    }
}
