//! Node specifications
//!
//! A node is the unit of work in the graph: an event-loop node drives the
//! LLM and tools, a function node is a pure mapping over declared keys, a
//! client-facing node additionally awaits user input, and a terminal node
//! ends the run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::CoreError;

/// Unique identifier of a node in the graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// LLM + tool loop adjudicated by the judge
    EventLoop,
    /// Pure registered function over declared inputs
    Function,
    /// Event loop that must request user input before writing outputs
    ClientFacingEventLoop,
    /// Reaching this node ends the run
    Terminal,
}

impl NodeKind {
    /// Whether this kind runs the event-loop runtime
    pub fn is_event_loop(&self) -> bool {
        matches!(self, NodeKind::EventLoop | NodeKind::ClientFacingEventLoop)
    }

    pub fn is_client_facing(&self) -> bool {
        matches!(self, NodeKind::ClientFacingEventLoop)
    }
}

/// Specification of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Memory keys rendered into the system prompt
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Memory keys this node is allowed to write via `set_output`
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Output keys that may legitimately be absent after completion
    #[serde(default)]
    pub nullable_output_keys: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Tool names this node may call (beyond the implicit `set_output`)
    #[serde(default)]
    pub tools: Vec<String>,
    /// Registered function name (function nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default = "default_max_visits")]
    pub max_visits: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps_per_visit: u32,
}

fn default_max_visits() -> u32 {
    3
}

fn default_max_steps() -> u32 {
    10
}

impl NodeSpec {
    pub fn event_loop(id: impl Into<NodeId>) -> Self {
        Self::with_kind(id, NodeKind::EventLoop)
    }

    pub fn client_facing(id: impl Into<NodeId>) -> Self {
        Self::with_kind(id, NodeKind::ClientFacingEventLoop)
    }

    pub fn function(id: impl Into<NodeId>, function_name: impl Into<String>) -> Self {
        let mut node = Self::with_kind(id, NodeKind::Function);
        node.function_name = Some(function_name.into());
        node
    }

    pub fn terminal(id: impl Into<NodeId>) -> Self {
        Self::with_kind(id, NodeKind::Terminal)
    }

    fn with_kind(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            nullable_output_keys: Vec::new(),
            system_prompt: String::new(),
            tools: Vec::new(),
            function_name: None,
            max_visits: default_max_visits(),
            max_steps_per_visit: default_max_steps(),
        }
    }

    pub fn with_input_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_nullable_output_keys(
        mut self,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.nullable_output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_visits(mut self, max_visits: u32) -> Self {
        self.max_visits = max_visits;
        self
    }

    pub fn with_max_steps_per_visit(mut self, max_steps: u32) -> Self {
        self.max_steps_per_visit = max_steps;
        self
    }

    /// Output keys that must be present after a successful visit
    pub fn required_output_keys(&self) -> Vec<&str> {
        self.output_keys
            .iter()
            .filter(|k| !self.nullable_output_keys.contains(k))
            .map(|k| k.as_str())
            .collect()
    }

    /// Per-node invariants checked during graph validation
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::graph_invalid("node id must not be empty"));
        }

        let declared: HashSet<&str> = self.output_keys.iter().map(|k| k.as_str()).collect();
        for key in &self.nullable_output_keys {
            if !declared.contains(key.as_str()) {
                return Err(CoreError::graph_invalid(format!(
                    "node '{}': nullable output key '{}' is not in output_keys",
                    self.id, key
                )));
            }
        }

        if self.kind == NodeKind::Function && self.function_name.is_none() {
            return Err(CoreError::graph_invalid(format!(
                "function node '{}' names no registered function",
                self.id
            )));
        }

        if self.kind.is_event_loop() && self.max_steps_per_visit == 0 {
            return Err(CoreError::graph_invalid(format!(
                "node '{}': max_steps_per_visit must be at least 1",
                self.id
            )));
        }

        Ok(())
    }
}
