//! Registered node functions
//!
//! A function node is a pure mapping from its declared input keys to its
//! declared output keys. Functions are registered by name and resolved at
//! run start, mirroring how tools resolve in the dispatcher.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::CoreError;

/// The mapping behind one function node
#[async_trait]
pub trait NodeFunction: Send + Sync {
    /// Map declared inputs to declared outputs
    ///
    /// Inputs hold the node's `input_keys` that are present in memory.
    /// Returned keys must be a subset of the node's `output_keys`.
    async fn call(
        &self,
        inputs: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, CoreError>;
}

/// Name-to-function registry
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn NodeFunction>) -> &mut Self {
        self.functions.insert(name.into(), function);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}
