//! Tool dispatch and the typed tool registry
//!
//! Tools are looked up by name in a registry mapping each name to a typed
//! descriptor (schema + handler). Dispatch failures are structured results
//! fed back to the model, never panics or silent drops. The privileged
//! `set_output` tool is declared here but handled by the node runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::ToolSchema;

/// Name of the privileged output-writing tool present in every node's
/// tool list
pub const SET_OUTPUT: &str = "set_output";

/// Category of a tool failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Transport,
    Auth,
    RateLimit,
    Timeout,
    InvalidArguments,
    NotFound,
    Execution,
}

/// Structured tool failure returned to the model and the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    pub retriable: bool,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let retriable = matches!(
            kind,
            ToolErrorKind::Transport | ToolErrorKind::RateLimit | ToolErrorKind::Timeout
        );
        Self {
            kind,
            message: message.into(),
            retriable,
        }
    }

    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: ToolError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Render the outcome as tool-result message content
    pub fn render(&self) -> String {
        if self.ok {
            self.result
                .as_ref()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        } else {
            self.error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown tool error".to_string())
        }
    }
}

/// The dispatch interface the node runtime drives
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Invoke a named tool with a JSON argument object
    async fn invoke(&self, tool_name: &str, arguments: Value) -> ToolOutcome;

    /// Schemas of every dispatchable tool
    fn list(&self) -> Vec<ToolSchema>;

    /// Whether a tool name resolves
    fn contains(&self, tool_name: &str) -> bool {
        self.list().iter().any(|t| t.name == tool_name)
    }
}

/// Handler behind one registered tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Typed descriptor for a registered tool
#[derive(Clone)]
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.schema.name)
            .finish()
    }
}

/// Registry mapping tool names to typed descriptors
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a duplicate name replaces the old descriptor
    pub fn register(&mut self, schema: ToolSchema, handler: Arc<dyn ToolHandler>) -> &mut Self {
        self.tools
            .insert(schema.name.clone(), ToolDescriptor { schema, handler });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolDispatcher for ToolRegistry {
    async fn invoke(&self, tool_name: &str, arguments: Value) -> ToolOutcome {
        let Some(descriptor) = self.tools.get(tool_name) else {
            return ToolOutcome::failure(ToolError::new(
                ToolErrorKind::NotFound,
                format!("no tool named '{tool_name}'"),
            ));
        };

        match descriptor.handler.call(arguments).await {
            Ok(result) => ToolOutcome::success(result),
            Err(error) => ToolOutcome::failure(error),
        }
    }

    fn list(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|d| d.schema.clone()).collect()
    }

    fn contains(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }
}

/// Argument schema for `set_output`, derived from a node's output keys
///
/// Accepts any subset of the declared keys; the runtime validates the
/// required ones after the write.
pub fn set_output_schema(output_keys: &[String]) -> ToolSchema {
    let properties: serde_json::Map<String, Value> = output_keys
        .iter()
        .map(|key| (key.clone(), json!({})))
        .collect();

    ToolSchema::new(
        SET_OUTPUT,
        "Write one or more of this node's declared output keys to shared memory. \
         Call this once your result is ready; keys outside the declared set are rejected.",
        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        }),
    )
}
