//! Run memory
//!
//! Keyed shared state read and written by nodes during a run. Values are
//! JSON-representable (`serde_json::Value` is the tagged union); every
//! write is attributed to the node that made it. Parallel branches work
//! on snapshots and merge back at the join, where key collisions are a
//! fault rather than a silent last-writer-wins.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::CoreError;

/// Pseudo-writer attributed to keys seeded from the run input
pub const INPUT_WRITER: &str = "input";

/// Keyed memory for a single run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    values: BTreeMap<String, Value>,
    writers: BTreeMap<String, String>,
}

/// Writes a branch produced relative to its base snapshot
pub type BranchWrites = BTreeMap<String, (Value, String)>;

impl Memory {
    /// Create an empty memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed memory from the run input
    ///
    /// A JSON object seeds one key per top-level field; any other value is
    /// stored under the `input` key. All seeded keys are attributed to the
    /// `input` pseudo-writer.
    pub fn seed_input(&mut self, input: &Value) {
        match input {
            Value::Object(fields) => {
                for (key, value) in fields {
                    self.insert(key.clone(), value.clone(), INPUT_WRITER);
                }
            }
            Value::Null => {}
            other => {
                self.insert(INPUT_WRITER.to_string(), other.clone(), INPUT_WRITER);
            }
        }
    }

    /// Read a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Write a value, attributing it to `writer`
    pub fn insert(&mut self, key: String, value: Value, writer: impl Into<String>) {
        self.writers.insert(key.clone(), writer.into());
        self.values.insert(key, value);
    }

    /// The node (or `input`) that last wrote a key
    pub fn writer_of(&self, key: &str) -> Option<&str> {
        self.writers.get(key).map(|s| s.as_str())
    }

    /// All keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    /// Borrow the full value map
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether memory holds no keys
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Branch-local copy for parallel execution
    pub fn snapshot(&self) -> Memory {
        self.clone()
    }

    /// Keys this memory wrote relative to a base snapshot
    ///
    /// A key counts as written when it is new, its value changed, or its
    /// attribution changed (a branch node re-wrote an existing value).
    pub fn writes_since(&self, base: &Memory) -> BranchWrites {
        let mut writes = BranchWrites::new();
        for (key, value) in &self.values {
            let writer = self
                .writers
                .get(key)
                .cloned()
                .unwrap_or_else(|| INPUT_WRITER.to_string());
            let changed = match base.values.get(key) {
                None => true,
                Some(old) => old != value || base.writers.get(key) != self.writers.get(key),
            };
            if changed {
                writes.insert(key.clone(), (value.clone(), writer));
            }
        }
        writes
    }

    /// Merge parallel branch writes back into shared memory
    ///
    /// The collision check runs across the whole batch before any write
    /// lands, so a conflicting merge leaves memory untouched. Writes apply
    /// in declared branch order.
    pub fn merge_branches(
        &mut self,
        branches: Vec<(String, BranchWrites)>,
    ) -> Result<(), CoreError> {
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        for (label, writes) in &branches {
            for key in writes.keys() {
                if let Some(first) = claimed.get(key.as_str()) {
                    return Err(CoreError::BranchMergeConflict {
                        key: key.clone(),
                        first: (*first).to_string(),
                        second: label.clone(),
                    });
                }
                claimed.insert(key.as_str(), label.as_str());
            }
        }

        for (_, writes) in branches {
            for (key, (value, writer)) in writes {
                self.insert(key, value, writer);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_object_input() {
        let mut memory = Memory::new();
        memory.seed_input(&json!({"topic": "rust", "depth": 2}));

        assert_eq!(memory.get("topic"), Some(&json!("rust")));
        assert_eq!(memory.get("depth"), Some(&json!(2)));
        assert_eq!(memory.writer_of("topic"), Some(INPUT_WRITER));
    }

    #[test]
    fn test_seed_scalar_input() {
        let mut memory = Memory::new();
        memory.seed_input(&json!("just a string"));
        assert_eq!(memory.get(INPUT_WRITER), Some(&json!("just a string")));
    }

    #[test]
    fn test_seed_null_input_is_empty() {
        let mut memory = Memory::new();
        memory.seed_input(&Value::Null);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_insert_attributes_writer() {
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!("ok"), "intake");
        assert_eq!(memory.writer_of("summary"), Some("intake"));

        // Overwrites re-attribute
        memory.insert("summary".into(), json!("better"), "refiner");
        assert_eq!(memory.writer_of("summary"), Some("refiner"));
        assert_eq!(memory.get("summary"), Some(&json!("better")));
    }

    #[test]
    fn test_writes_since_detects_new_and_changed() {
        let mut base = Memory::new();
        base.insert("a".into(), json!(1), "n1");
        base.insert("b".into(), json!(2), "n1");

        let mut branch = base.snapshot();
        branch.insert("b".into(), json!(3), "n2");
        branch.insert("c".into(), json!(4), "n2");

        let writes = branch.writes_since(&base);
        assert_eq!(writes.len(), 2);
        assert!(writes.contains_key("b"));
        assert!(writes.contains_key("c"));
        assert!(!writes.contains_key("a"));
    }

    #[test]
    fn test_writes_since_detects_reattribution() {
        let mut base = Memory::new();
        base.insert("a".into(), json!(1), "n1");

        let mut branch = base.snapshot();
        branch.insert("a".into(), json!(1), "n2");

        let writes = branch.writes_since(&base);
        assert!(writes.contains_key("a"));
    }

    #[test]
    fn test_merge_disjoint_branches() {
        let mut memory = Memory::new();
        memory.insert("seed".into(), json!(0), INPUT_WRITER);

        let mut left = BranchWrites::new();
        left.insert("left_out".into(), (json!("l"), "left_node".into()));
        let mut right = BranchWrites::new();
        right.insert("right_out".into(), (json!("r"), "right_node".into()));

        memory
            .merge_branches(vec![("left".into(), left), ("right".into(), right)])
            .unwrap();

        assert_eq!(memory.get("left_out"), Some(&json!("l")));
        assert_eq!(memory.get("right_out"), Some(&json!("r")));
        assert_eq!(memory.writer_of("right_out"), Some("right_node"));
    }

    #[test]
    fn test_merge_conflict_leaves_memory_untouched() {
        let mut memory = Memory::new();

        let mut left = BranchWrites::new();
        left.insert("shared".into(), (json!("l"), "left_node".into()));
        left.insert("only_left".into(), (json!(1), "left_node".into()));
        let mut right = BranchWrites::new();
        right.insert("shared".into(), (json!("r"), "right_node".into()));

        let err = memory
            .merge_branches(vec![("left".into(), left), ("right".into(), right)])
            .unwrap_err();

        match err {
            CoreError::BranchMergeConflict { key, first, second } => {
                assert_eq!(key, "shared");
                assert_eq!(first, "left");
                assert_eq!(second, "right");
            }
            other => panic!("expected BranchMergeConflict, got {other:?}"),
        }
        // Nothing landed, not even the non-conflicting key
        assert!(memory.is_empty());
    }

    #[test]
    fn test_memory_round_trips_through_json() {
        let mut memory = Memory::new();
        memory.insert("k".into(), json!({"nested": [1, 2]}), "node");

        let encoded = serde_json::to_string(&memory).unwrap();
        let decoded: Memory = serde_json::from_str(&encoded).unwrap();
        assert_eq!(memory, decoded);
    }
}
